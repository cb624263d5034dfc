use std::{fmt, mem};

use log::trace;
use static_assertions::const_assert_eq;

use crate::usb;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    /* Reserved */
    GetExtendedProperty,
    SetExtendedProperty,
    Rsv26,
    Rsv27,
    Rsv28,
    Rsv29,
    Rsv30,
    Rsv31,
    /* Events */
    Transfer,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
    /* Reserved from 40 to 47, vendor devined from 48 to 63 */
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyTooLarge = 0x1D,
    Rsv30 = 0x1E,
    IsochBuffer = 0x1F,
    EventLost = 0x20,
    Undefined = 0x21,
    InvalidStreamId = 0x22,
    SecondaryBandwidth = 0x23,
    SplitTransaction = 0x24,
    /* Values from 37 to 191 are reserved */
    /* 192 to 223 are vendor defined errors */
    /* 224 to 255 are vendor defined information */
}

/// Transfer Type of a Setup Stage TRB. (XHCI Table 6-26)
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}

/// A Transfer Request Block, the 16-byte unit of every ring. (XHCI 4.11)
///
/// The TRB is built in host memory and only copied into a ring by [super::ring::Ring::push],
/// which also stamps the cycle bit. Fields are kept as little-endian bytes:
///
/// - bytes 0-7: the parameter, usually a pointer or immediate data
/// - bytes 8-11: the status
/// - bytes 12-15: the control word, carrying the cycle bit (bit 0) and the TRB type (bits 10-15)
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Trb {
    raw: [u8; 16],
}

const_assert_eq!(mem::size_of::<Trb>(), 16);
const_assert_eq!(mem::align_of::<Trb>(), 16);

pub const TRB_SIZE: usize = 16;
pub const TRB_PARAM_OFFSET: usize = 0;
pub const TRB_STATUS_OFFSET: usize = 8;
pub const TRB_CONTROL_OFFSET: usize = 12;

pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_COMPLETION_CODE_MASK: u32 = 0xFF00_0000;

pub const TRB_STATUS_COMPLETION_PARAM_SHIFT: u8 = 0;
pub const TRB_STATUS_COMPLETION_PARAM_MASK: u32 = 0x00FF_FFFF;

pub const TRB_STATUS_TRANSFER_LENGTH_SHIFT: u8 = 0;
/// Residual length of a Transfer Event.
pub const TRB_STATUS_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;
/// Buffer length of a transfer TRB, which shares its dword with the TD Size.
pub const TRB_STATUS_TRB_LENGTH_MASK: u32 = 0x0001_FFFF;

pub const TRB_STATUS_TD_SIZE_SHIFT: u8 = 17;
pub const TRB_STATUS_TD_SIZE_MASK: u32 = 0x003E_0000;
pub const TRB_STATUS_INTERRUPTER_SHIFT: u8 = 22;

pub const TRB_CONTROL_CYCLE_BIT: u32 = 1 << 0;
pub const TRB_CONTROL_TOGGLE_CYCLE_BIT: u32 = 1 << 1;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;

pub const TRB_CONTROL_EVENT_DATA_SHIFT: u8 = 2;
pub const TRB_CONTROL_EVENT_DATA_BIT: u32 = 1 << TRB_CONTROL_EVENT_DATA_SHIFT;

pub const TRB_CONTROL_ENT_BIT: u32 = 1 << 1;
pub const TRB_CONTROL_ISP_BIT: u32 = 1 << 2;
pub const TRB_CONTROL_CHAIN_BIT: u32 = 1 << 4;
pub const TRB_CONTROL_IOC_BIT: u32 = 1 << 5;
pub const TRB_CONTROL_IDT_BIT: u32 = 1 << 6;
pub const TRB_CONTROL_BSR_BIT: u32 = 1 << 9;
pub const TRB_CONTROL_BEI_BIT: u32 = 1 << 9;
pub const TRB_CONTROL_DIR_IN_BIT: u32 = 1 << 16;

pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;

pub const TRB_CONTROL_SLOT_ID_MASK: u32 = 0xFF00_0000;
pub const TRB_CONTROL_SLOT_ID_SHIFT: u8 = 24;

/// The largest TD Size a TRB can report; larger remainders saturate.
pub const TRB_TD_SIZE_MAX: u32 = 31;

/// Bit 31 of a status word, set by the event processor once the controller has completed the
/// command or transfer the status word belongs to.
///
/// The hardware never sets this bit in a TRB the driver produced, and the completion codes the
/// driver cares about all fit in the remaining seven bits of the code field.
pub const STATUS_DONE_BIT: u32 = 1 << 31;

/// Where a waiter stands with the status word it polls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionState {
    Pending,
    /// Completed. `status` is the completion status with the done bit removed.
    Done { status: u32 },
}

impl CompletionState {
    pub fn from_status(status: u32) -> Self {
        if status & STATUS_DONE_BIT != 0 {
            CompletionState::Done {
                status: status & !STATUS_DONE_BIT,
            }
        } else {
            CompletionState::Pending
        }
    }

    /// The status word that reports `status` as completed.
    pub fn done(status: u32) -> u32 {
        status | STATUS_DONE_BIT
    }
}

/// The completion code field of a status word, ignoring the done bit.
pub fn completion_code_of(status: u32) -> u8 {
    ((status >> TRB_STATUS_COMPLETION_CODE_SHIFT) & 0x7F) as u8
}

impl Trb {
    pub fn new(param: u64, status: u32, control: u32) -> Self {
        let mut trb = Self::default();
        trb.set(param, status, control);
        trb
    }

    pub fn set(&mut self, param: u64, status: u32, control: u32) {
        self.raw[0..8].copy_from_slice(&param.to_le_bytes());
        self.raw[8..12].copy_from_slice(&status.to_le_bytes());
        self.raw[12..16].copy_from_slice(&control.to_le_bytes());
    }

    pub fn param(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.raw[0..8]);
        u64::from_le_bytes(bytes)
    }
    pub fn status(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[8..12]);
        u32::from_le_bytes(bytes)
    }
    pub fn control(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[12..16]);
        u32::from_le_bytes(bytes)
    }

    pub fn set_status(&mut self, status: u32) {
        self.raw[8..12].copy_from_slice(&status.to_le_bytes());
    }
    pub fn set_control(&mut self, control: u32) {
        self.raw[12..16].copy_from_slice(&control.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.raw
    }

    pub fn cycle(&self) -> bool {
        self.control() & TRB_CONTROL_CYCLE_BIT != 0
    }
    pub fn set_cycle(&mut self, cycle: bool) {
        self.set_control((self.control() & !TRB_CONTROL_CYCLE_BIT) | u32::from(cycle));
    }

    pub fn completion_code(&self) -> u8 {
        (self.status() >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8
    }
    pub fn completion_param(&self) -> u32 {
        self.status() & TRB_STATUS_COMPLETION_PARAM_MASK
    }
    fn has_completion_trb_pointer(&self) -> bool {
        if self.completion_code() == TrbCompletionCode::RingUnderrun as u8
            || self.completion_code() == TrbCompletionCode::RingOverrun as u8
        {
            false
        } else if self.completion_code() == TrbCompletionCode::VfEventRingFull as u8 {
            false
        } else {
            true
        }
    }

    /// One-based root hub port of a Port Status Change event.
    pub fn port_status_change_port_id(&self) -> Option<u8> {
        debug_assert_eq!(self.trb_type(), TrbType::PortStatusChange as u8);

        if self.has_completion_trb_pointer() {
            Some(((self.param() >> 24) & 0xFF) as u8)
        } else {
            None
        }
    }

    pub fn event_slot(&self) -> u8 {
        (self.control() >> TRB_CONTROL_SLOT_ID_SHIFT) as u8
    }
    /// For a Transfer Event, the number of bytes that should have been transmitted but weren't.
    /// For a transfer TRB, the length of its buffer.
    pub fn transfer_length(&self) -> u32 {
        if self.is_type(TrbType::Transfer) {
            self.status() & TRB_STATUS_TRANSFER_LENGTH_MASK
        } else {
            self.status() & TRB_STATUS_TRB_LENGTH_MASK
        }
    }
    pub fn td_size(&self) -> u8 {
        ((self.status() & TRB_STATUS_TD_SIZE_MASK) >> TRB_STATUS_TD_SIZE_SHIFT) as u8
    }
    pub fn event_data_bit(&self) -> bool {
        self.control() & TRB_CONTROL_EVENT_DATA_BIT != 0
    }
    pub fn endpoint_id(&self) -> u8 {
        ((self.control() & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT) as u8
    }
    pub fn trb_type(&self) -> u8 {
        ((self.control() & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }
    pub fn is_type(&self, ty: TrbType) -> bool {
        self.trb_type() == ty as u8
    }

    pub fn link(&mut self, address: u64, toggle: bool) {
        self.set(
            address,
            0,
            ((TrbType::Link as u32) << 10) | (u32::from(toggle) << 1),
        );
    }

    pub fn no_op_cmd(&mut self) {
        self.set(0, 0, (TrbType::NoOpCmd as u32) << 10);
    }

    pub fn enable_slot(&mut self, slot_type: u8) {
        trace!("Enabling slot with type {}", slot_type);
        self.set(
            0,
            0,
            (((slot_type as u32) & 0x1F) << 16) | ((TrbType::EnableSlot as u32) << 10),
        );
    }
    pub fn disable_slot(&mut self, slot: u8) {
        self.set(
            0,
            0,
            (u32::from(slot) << 24) | ((TrbType::DisableSlot as u32) << 10),
        );
    }

    pub fn address_device(&mut self, slot_id: u8, input_ctx_ptr: u64, bsr: bool) {
        assert_eq!(
            input_ctx_ptr & 0xFFFF_FFFF_FFFF_FFF0,
            input_ctx_ptr,
            "unaligned input context ptr"
        );
        self.set(
            input_ctx_ptr,
            0,
            (u32::from(slot_id) << 24)
                | ((TrbType::AddressDevice as u32) << 10)
                | (u32::from(bsr) << 9),
        );
    }
    pub fn configure_endpoint(&mut self, slot_id: u8, input_ctx_ptr: u64) {
        assert_eq!(
            input_ctx_ptr & 0xFFFF_FFFF_FFFF_FFF0,
            input_ctx_ptr,
            "unaligned input context ptr"
        );

        self.set(
            input_ctx_ptr,
            0,
            (u32::from(slot_id) << 24) | ((TrbType::ConfigureEndpoint as u32) << 10),
        );
    }
    pub fn evaluate_context(&mut self, slot_id: u8, input_ctx_ptr: u64, bsr: bool) {
        assert_eq!(
            input_ctx_ptr & 0xFFFF_FFFF_FFFF_FFF0,
            input_ctx_ptr,
            "unaligned input context ptr"
        );
        self.set(
            input_ctx_ptr,
            0,
            (u32::from(slot_id) << 24)
                | ((TrbType::EvaluateContext as u32) << 10)
                | (u32::from(bsr) << 9),
        );
    }
    pub fn reset_endpoint(&mut self, slot_id: u8, endp_num_xhc: u8, tsp: bool) {
        assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24)
                | (u32::from(endp_num_xhc) << 16)
                | ((TrbType::ResetEndpoint as u32) << 10)
                | (u32::from(tsp) << 9),
        );
    }
    pub fn stop_endpoint(&mut self, slot_id: u8, endp_num_xhc: u8, suspend: bool) {
        assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24)
                | (u32::from(suspend) << 23)
                | (u32::from(endp_num_xhc) << 16)
                | ((TrbType::StopEndpoint as u32) << 10),
        );
    }
    pub fn reset_device(&mut self, slot_id: u8) {
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24) | ((TrbType::ResetDevice as u32) << 10),
        );
    }

    pub fn setup(&mut self, setup: usb::Setup, transfer: TransferKind, interrupter: u16) {
        self.set(
            setup.to_param(),
            8 | (u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT),
            ((transfer as u32) << 16) | ((TrbType::SetupStage as u32) << 10) | TRB_CONTROL_IDT_BIT,
        );
    }

    /// The first TRB of a data stage. `td_size` is the number of packets still to come after
    /// this one.
    pub fn data(
        &mut self,
        buffer: u64,
        length: u32,
        td_size: u32,
        interrupter: u16,
        input: bool,
        chain: bool,
        ent: bool,
    ) {
        self.set(
            buffer,
            (length & TRB_STATUS_TRB_LENGTH_MASK)
                | (td_size.min(TRB_TD_SIZE_MAX) << TRB_STATUS_TD_SIZE_SHIFT)
                | (u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT),
            (u32::from(input) << 16)
                | ((TrbType::DataStage as u32) << 10)
                | (u32::from(chain) << 4)
                | (u32::from(ent) << 1),
        );
    }

    pub fn status_stage(
        &mut self,
        interrupter: u16,
        input: bool,
        ioc: bool,
        ch: bool,
        ent: bool,
    ) {
        self.set(
            0,
            u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT,
            (u32::from(input) << 16)
                | ((TrbType::StatusStage as u32) << 10)
                | (u32::from(ioc) << 5)
                | (u32::from(ch) << 4)
                | (u32::from(ent) << 1),
        );
    }

    pub fn normal(
        &mut self,
        buffer: u64,
        len: u32,
        estimated_td_size: u8,
        interrupter: u16,
        ent: bool,
        isp: bool,
        chain: bool,
        ioc: bool,
        idt: bool,
        bei: bool,
    ) {
        assert_eq!(estimated_td_size & 0x1F, estimated_td_size);
        // NOTE: The no snoop flag has been omitted.
        self.set(
            buffer,
            (len & TRB_STATUS_TRB_LENGTH_MASK)
                | (u32::from(estimated_td_size) << TRB_STATUS_TD_SIZE_SHIFT)
                | (u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT),
            (u32::from(ent) << 1)
                | (u32::from(isp) << 2)
                | (u32::from(chain) << 4)
                | (u32::from(ioc) << 5)
                | (u32::from(idt) << 6)
                | (u32::from(bei) << 9)
                | ((TrbType::Normal as u32) << 10),
        )
    }

    /// An Event Data TRB. On completion the controller posts a transfer event with the ED bit set
    /// and `status_ptr` as its parameter.
    pub fn event_data_trb(&mut self, status_ptr: u64, interrupter: u16, chain: bool, ioc: bool) {
        self.set(
            status_ptr,
            u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT,
            (u32::from(ioc) << 5) | (u32::from(chain) << 4) | ((TrbType::EventData as u32) << 10),
        );
    }

    pub fn transfer_no_op(&mut self, interrupter: u16, ent: bool, ch: bool, ioc: bool) {
        self.set(
            0,
            u32::from(interrupter) << TRB_STATUS_INTERRUPTER_SHIFT,
            ((TrbType::NoOp as u32) << 10)
                | (u32::from(ioc) << 5)
                | (u32::from(ch) << 4)
                | (u32::from(ent) << 1),
        );
    }

    pub fn is_command_trb(&self) -> bool {
        let valid_trb_types = [
            TrbType::NoOpCmd as u8,
            TrbType::EnableSlot as u8,
            TrbType::DisableSlot as u8,
            TrbType::AddressDevice as u8,
            TrbType::ConfigureEndpoint as u8,
            TrbType::EvaluateContext as u8,
            TrbType::ResetEndpoint as u8,
            TrbType::StopEndpoint as u8,
            TrbType::SetTrDequeuePointer as u8,
            TrbType::ResetDevice as u8,
            TrbType::ForceEvent as u8,
            TrbType::NegotiateBandwidth as u8,
            TrbType::SetLatencyToleranceValue as u8,
            TrbType::GetPortBandwidth as u8,
            TrbType::ForceHeader as u8,
            TrbType::GetExtendedProperty as u8,
            TrbType::SetExtendedProperty as u8,
        ];
        valid_trb_types.contains(&self.trb_type())
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.param(),
            self.status(),
            self.control()
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({:>016X}, {:>08X}, {:>08X})",
            self.param(),
            self.status(),
            self.control()
        )
    }
}
