use std::sync::Arc;

use common::dma::{Dma, DmaAllocator};
use log::debug;

use crate::{Result, XhciError};

/// Only the first 32 bytes of a context carry fields. With 64-byte contexts the rest is reserved.
pub const CONTEXT_FIELDS_LEN: usize = 32;

/// Slot context plus 31 endpoint contexts.
pub const DEVICE_CONTEXT_ENTRIES: usize = 32;
/// Input control context in front of a device context.
pub const INPUT_CONTEXT_ENTRIES: usize = 33;

pub const CONTEXT_ALIGN: usize = 64;

/// The DCBAA is sized for the largest possible MaxSlots, plus entry 0 for the scratchpad array.
pub const DCBAA_ENTRIES: usize = 256;

macro_rules! dword_field {
    ($get:ident, $set:ident, $dword:expr, $mask:expr, $shift:expr, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            ((self.dword($dword) & $mask) >> $shift) as $ty
        }
        pub fn $set(&mut self, value: $ty) {
            let dword = (self.dword($dword) & !$mask) | ((u32::from(value) << $shift) & $mask);
            self.set_dword($dword, dword);
        }
    };
}

fn read_dword(raw: &[u8; CONTEXT_FIELDS_LEN], index: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[index * 4..index * 4 + 4]);
    u32::from_le_bytes(bytes)
}

fn write_dword(raw: &mut [u8; CONTEXT_FIELDS_LEN], index: usize, value: u32) {
    raw[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    EnabledOrDisabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
}

/// A Slot Context (XHCI 6.2.2), kept in host memory and copied in and out of device and input
/// contexts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlotContext {
    raw: [u8; CONTEXT_FIELDS_LEN],
}

impl SlotContext {
    pub fn from_bytes(raw: [u8; CONTEXT_FIELDS_LEN]) -> Self {
        Self { raw }
    }
    pub fn as_bytes(&self) -> &[u8; CONTEXT_FIELDS_LEN] {
        &self.raw
    }
    pub fn dword(&self, index: usize) -> u32 {
        read_dword(&self.raw, index)
    }
    pub fn set_dword(&mut self, index: usize, value: u32) {
        write_dword(&mut self.raw, index, value)
    }

    dword_field!(route_string, set_route_string, 0, 0x000F_FFFF, 0, u32);
    dword_field!(speed, set_speed, 0, 0x00F0_0000, 20, u8);
    dword_field!(context_entries, set_context_entries, 0, 0xF800_0000, 27, u8);
    dword_field!(max_exit_latency, set_max_exit_latency, 1, 0x0000_FFFF, 0, u16);
    dword_field!(root_hub_port, set_root_hub_port, 1, 0x00FF_0000, 16, u8);
    dword_field!(num_ports, set_num_ports, 1, 0xFF00_0000, 24, u8);
    dword_field!(interrupter, set_interrupter, 2, 0xFFC0_0000, 22, u16);
    dword_field!(device_address, set_device_address, 3, 0x0000_00FF, 0, u8);
    dword_field!(slot_state_raw, set_slot_state_raw, 3, 0xF800_0000, 27, u8);

    pub fn slot_state(&self) -> Option<SlotState> {
        match self.slot_state_raw() {
            0 => Some(SlotState::EnabledOrDisabled),
            1 => Some(SlotState::Default),
            2 => Some(SlotState::Addressed),
            3 => Some(SlotState::Configured),
            _ => None,
        }
    }

    /// The slot context of a device directly on root hub port `port` (zero-based), with only the
    /// default control endpoint valid.
    pub fn root_port_device(port: usize, speed: u8) -> Self {
        let mut slot = Self::default();
        slot.set_context_entries(1);
        slot.set_speed(speed);
        slot.set_route_string(0);
        slot.set_root_hub_port(port as u8 + 1);
        slot.set_max_exit_latency(0);
        slot.set_interrupter(0);
        slot.set_device_address(0);
        slot.set_slot_state_raw(SlotState::EnabledOrDisabled as u8);
        slot
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    NotValid = 0,
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
}

/// Average TRB length hint for control and interrupt endpoints.
pub const DEFAULT_AVERAGE_TRB_LENGTH: u16 = 8;
/// Retries the controller makes on bus errors before halting the endpoint.
pub const DEFAULT_ERROR_COUNT: u8 = 3;

pub const ENDPOINT_CONTEXT_DCS_BIT: u64 = 1;

/// An Endpoint Context. (XHCI 6.2.3)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EndpointContext {
    raw: [u8; CONTEXT_FIELDS_LEN],
}

impl EndpointContext {
    pub fn from_bytes(raw: [u8; CONTEXT_FIELDS_LEN]) -> Self {
        Self { raw }
    }
    pub fn as_bytes(&self) -> &[u8; CONTEXT_FIELDS_LEN] {
        &self.raw
    }
    pub fn dword(&self, index: usize) -> u32 {
        read_dword(&self.raw, index)
    }
    pub fn set_dword(&mut self, index: usize, value: u32) {
        write_dword(&mut self.raw, index, value)
    }

    dword_field!(state, set_state, 0, 0x0000_0007, 0, u8);
    dword_field!(mult, set_mult, 0, 0x0000_0300, 8, u8);
    dword_field!(max_pstreams, set_max_pstreams, 0, 0x0000_7C00, 10, u8);
    dword_field!(interval, set_interval, 0, 0x00FF_0000, 16, u8);
    dword_field!(max_esit_payload_hi, set_max_esit_payload_hi, 0, 0xFF00_0000, 24, u8);
    dword_field!(error_count, set_error_count, 1, 0x0000_0006, 1, u8);
    dword_field!(ep_type_raw, set_ep_type_raw, 1, 0x0000_0038, 3, u8);
    dword_field!(max_burst, set_max_burst, 1, 0x0000_FF00, 8, u8);
    dword_field!(max_packet_size, set_max_packet_size, 1, 0xFFFF_0000, 16, u16);
    dword_field!(average_trb_length, set_average_trb_length, 4, 0x0000_FFFF, 0, u16);
    dword_field!(max_esit_payload_lo, set_max_esit_payload_lo, 4, 0xFFFF_0000, 16, u16);

    pub fn set_ep_type(&mut self, ty: EndpointType) {
        self.set_ep_type_raw(ty as u8);
    }

    /// TR Dequeue Pointer with the Dequeue Cycle State in bit 0.
    pub fn dequeue(&self) -> u64 {
        u64::from(self.dword(2)) | (u64::from(self.dword(3)) << 32)
    }
    pub fn set_dequeue(&mut self, pointer: u64) {
        self.set_dword(2, pointer as u32);
        self.set_dword(3, (pointer >> 32) as u32);
    }

    pub fn max_esit_payload(&self) -> u32 {
        u32::from(self.max_esit_payload_lo()) | (u32::from(self.max_esit_payload_hi()) << 16)
    }
    pub fn set_max_esit_payload(&mut self, payload: u32) {
        self.set_max_esit_payload_lo((payload & 0xFFFF) as u16);
        self.set_max_esit_payload_hi(((payload >> 16) & 0xFF) as u8);
    }

    /// The default control endpoint, with its transfer ring at `dequeue` (cycle bit included).
    pub fn control(max_packet_size: u16, dequeue: u64) -> Self {
        let mut ep = Self::default();
        ep.set_dequeue(dequeue);
        ep.set_max_packet_size(max_packet_size);
        ep.set_max_pstreams(0);
        ep.set_mult(0);
        ep.set_state(EndpointState::Disabled as u8);
        ep.set_ep_type(EndpointType::Control);
        ep.set_average_trb_length(DEFAULT_AVERAGE_TRB_LENGTH);
        ep.set_error_count(DEFAULT_ERROR_COUNT);
        ep.set_max_burst(0);
        ep.set_interval(0);
        ep
    }

    /// An interrupt endpoint at device context index `dci`. Odd indices are IN endpoints.
    pub fn interrupt(dci: u8, max_packet_size: u16, max_burst: u8, interval: u8, dequeue: u64) -> Self {
        let max_packet_size = max_packet_size & 0x7FF;

        let mut ep = Self::default();
        ep.set_dequeue(dequeue);
        ep.set_max_packet_size(max_packet_size);
        ep.set_max_burst(max_burst);
        ep.set_error_count(DEFAULT_ERROR_COUNT);
        ep.set_average_trb_length(DEFAULT_AVERAGE_TRB_LENGTH);
        ep.set_interval(interval);
        ep.set_ep_type(if dci % 2 == 1 {
            EndpointType::InterruptIn
        } else {
            EndpointType::InterruptOut
        });
        ep.set_max_esit_payload(u32::from(max_packet_size) * (u32::from(max_burst) + 1));
        ep
    }
}

fn read_block(dma: &Dma, offset: usize) -> [u8; CONTEXT_FIELDS_LEN] {
    let mut raw = [0u8; CONTEXT_FIELDS_LEN];
    dma.read_bytes(offset, &mut raw);
    raw
}

/// The output device context of one slot, owned by the controller once the slot is addressed.
pub struct DeviceContext {
    dma: Dma,
    context_size: usize,
}

impl DeviceContext {
    pub fn new(dma: &Arc<dyn DmaAllocator>, context_size: usize) -> Result<Self> {
        let dma = Dma::zeroed(dma, context_size * DEVICE_CONTEXT_ENTRIES, CONTEXT_ALIGN)
            .ok_or(XhciError::NoMemory)?;
        Ok(Self { dma, context_size })
    }

    pub fn physical(&self) -> u64 {
        self.dma.physical()
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_bytes(read_block(&self.dma, 0))
    }
    pub fn set_slot(&self, slot: &SlotContext) {
        self.dma.write_bytes(0, slot.as_bytes());
    }

    /// The endpoint context at device context index `dci`, 1 to 31.
    pub fn endpoint(&self, dci: u8) -> EndpointContext {
        EndpointContext::from_bytes(read_block(&self.dma, usize::from(dci) * self.context_size))
    }
    pub fn set_endpoint(&self, dci: u8, ep: &EndpointContext) {
        self.dma
            .write_bytes(usize::from(dci) * self.context_size, ep.as_bytes());
    }
}

pub const INPUT_DROP_FLAGS_OFFSET: usize = 0x00;
pub const INPUT_ADD_FLAGS_OFFSET: usize = 0x04;
pub const INPUT_CONTROL_DWORD7_OFFSET: usize = 0x1C;

/// An Input Context: the input control context followed by a device context. (XHCI 6.2.5)
pub struct InputContext {
    dma: Dma,
    context_size: usize,
}

impl InputContext {
    pub fn new(dma: &Arc<dyn DmaAllocator>, context_size: usize) -> Result<Self> {
        let dma = Dma::zeroed(dma, context_size * INPUT_CONTEXT_ENTRIES, CONTEXT_ALIGN)
            .ok_or(XhciError::NoMemory)?;
        Ok(Self { dma, context_size })
    }

    pub fn physical(&self) -> u64 {
        self.dma.physical()
    }

    pub fn drop_flags(&self) -> u32 {
        self.dma.read32(INPUT_DROP_FLAGS_OFFSET)
    }
    pub fn set_drop_flags(&self, flags: u32) {
        self.dma.write32(INPUT_DROP_FLAGS_OFFSET, flags);
    }
    pub fn add_flags(&self) -> u32 {
        self.dma.read32(INPUT_ADD_FLAGS_OFFSET)
    }
    pub fn set_add_flags(&self, flags: u32) {
        self.dma.write32(INPUT_ADD_FLAGS_OFFSET, flags);
    }

    /// Dword 7 of the input control context: configuration value, interface number and
    /// alternate setting.
    pub fn control(&self) -> u32 {
        self.dma.read32(INPUT_CONTROL_DWORD7_OFFSET)
    }
    pub fn set_control(&self, value: u32) {
        self.dma.write32(INPUT_CONTROL_DWORD7_OFFSET, value);
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext::from_bytes(read_block(&self.dma, self.context_size))
    }
    pub fn set_slot(&self, slot: &SlotContext) {
        self.dma.write_bytes(self.context_size, slot.as_bytes());
    }

    pub fn endpoint(&self, dci: u8) -> EndpointContext {
        EndpointContext::from_bytes(read_block(
            &self.dma,
            (usize::from(dci) + 1) * self.context_size,
        ))
    }
    pub fn set_endpoint(&self, dci: u8, ep: &EndpointContext) {
        self.dma
            .write_bytes((usize::from(dci) + 1) * self.context_size, ep.as_bytes());
    }

    pub fn dump_control(&self) {
        debug!(
            "INPUT CONTEXT: drop {:#x} add {:#x} control {:#x}",
            self.drop_flags(),
            self.add_flags(),
            self.control()
        );
    }
}

/// The Device Context Base Address Array, indexed by slot id. Entry 0 points at the scratchpad
/// buffer array when the controller wants one.
pub struct DeviceContextBaseAddressArray {
    dma: Dma,
}

impl DeviceContextBaseAddressArray {
    pub fn new(dma: &Arc<dyn DmaAllocator>) -> Result<Self> {
        let dma = Dma::zeroed(dma, DCBAA_ENTRIES * 8, CONTEXT_ALIGN).ok_or(XhciError::NoMemory)?;
        Ok(Self { dma })
    }

    pub fn physical(&self) -> u64 {
        self.dma.physical()
    }

    pub fn get(&self, slot: u8) -> u64 {
        self.dma.read64(usize::from(slot) * 8)
    }
    pub fn set(&self, slot: u8, phys: u64) {
        self.dma.write64(usize::from(slot) * 8, phys);
    }
}

/// The Scratchpad Buffer Array and the pages it points at. (XHCI 4.20)
pub struct ScratchpadBufferArray {
    entries: Dma,
    pages: Vec<Dma>,
}

impl ScratchpadBufferArray {
    pub fn new(dma: &Arc<dyn DmaAllocator>, count: u16, page_size: usize) -> Result<Self> {
        let entries =
            Dma::zeroed(dma, usize::from(count) * 8, CONTEXT_ALIGN).ok_or(XhciError::NoMemory)?;

        let pages = (0..usize::from(count))
            .map(|i| -> Result<Dma> {
                let page = Dma::zeroed(dma, page_size, page_size).ok_or(XhciError::NoMemory)?;
                entries.write64(i * 8, page.physical());
                Ok(page)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { entries, pages })
    }

    pub fn register(&self) -> u64 {
        self.entries.physical()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn entry(&self, i: usize) -> u64 {
        self.entries.read64(i * 8)
    }
}
