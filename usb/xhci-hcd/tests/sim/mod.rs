//! A simulated xHCI controller for driving the driver end to end.
//!
//! The register file is a plain array of dwords behind [SimWindow], and DMA memory comes from the
//! heap, with physical addresses offset from the virtual ones. A doorbell write is processed
//! synchronously: the controller consumes the ring, posts its events and then calls the interrupt
//! handler registered through [SimPlatform], on the same thread, before the write returns.
#![allow(dead_code)]

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::dma::{self, DmaAllocator};
use common::io::Io;
use crossbeam_channel::Receiver;
use xhci_hcd::platform::{InterruptFrame, IrqChip, IrqRegistration, PciFunction, Platform};
use xhci_hcd::usb::Setup;
use xhci_hcd::xhci::context::{EndpointContext, EndpointState, SlotContext, SlotState};
use xhci_hcd::xhci::extended::{LEGACY_BIOS_OWNED, LEGACY_OS_OWNED};
use xhci_hcd::xhci::operational::{
    USB_CMD_HCRST, USB_CMD_INTE, USB_CMD_RS, USB_STS_EINT, USB_STS_HCH, USB_STS_HSE, USB_STS_PCD,
    USB_STS_SRE,
};
use xhci_hcd::xhci::port::PortFlags;
use xhci_hcd::xhci::runtime::{ERDP_EHB, IMAN_IE, IMAN_IP};
use xhci_hcd::xhci::trb::{
    Trb, TrbCompletionCode, TrbType, TRB_CONTROL_EVENT_DATA_BIT, TRB_CONTROL_OFFSET,
    TRB_CONTROL_TOGGLE_CYCLE_BIT, TRB_PARAM_OFFSET, TRB_SIZE, TRB_STATUS_OFFSET,
};
use xhci_hcd::{HidReport, Result, XhciConfig, XhciControllers, XhciError, XHCI_CONFIG};

pub const BAR0: u64 = 0xFEB0_0000;
pub const BAR_STRIDE: u64 = 0x1_0000;

/// Physical addresses are the virtual ones shifted by this amount.
pub const PHYS_OFFSET: u64 = 0x1000_0000_0000_0000;

pub const CAPLENGTH: usize = 0x20;
pub const HCIVERSION: u32 = 0x0110;
pub const MAX_SLOTS: u8 = 8;
pub const MAX_PORTS: usize = 4;
pub const SCRATCHPADS: u32 = 2;
pub const XECP: usize = 0x100;
pub const RTSOFF: usize = 0x1000;
pub const DBOFF: usize = 0x2000;

const WINDOW_DWORDS: usize = 0x4000;
const CONTEXT_SIZE: u64 = 32;

const USBCMD: usize = CAPLENGTH;
const USBSTS: usize = CAPLENGTH + 0x04;
const PAGESIZE: usize = CAPLENGTH + 0x08;
const CRCR: usize = CAPLENGTH + 0x18;
const DCBAAP: usize = CAPLENGTH + 0x30;
const PORTSC: usize = CAPLENGTH + 0x400;
const IMAN: usize = RTSOFF + 0x20;
const ERSTBA: usize = RTSOFF + 0x30;
const ERDP: usize = RTSOFF + 0x38;

const LEGACY: usize = XECP;
const USB3_PROTOCOL: usize = XECP + 0x10;
const USB2_PROTOCOL: usize = XECP + 0x20;

pub fn portsc(port: usize) -> usize {
    PORTSC + port * 0x10
}

/// A boot keyboard report descriptor.
pub const KEYBOARD_REPORT: [u8; 63] = [
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25, 0x01,
    0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x01, 0x95, 0x05, 0x75, 0x01,
    0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, 0x95, 0x01, 0x75, 0x03, 0x91, 0x01, 0x95, 0x06,
    0x75, 0x08, 0x15, 0x00, 0x25, 0x65, 0x05, 0x07, 0x19, 0x00, 0x29, 0x65, 0x81, 0x00, 0xC0,
];

/// One configuration with a HID boot keyboard interface and its interrupt IN endpoint 1.
pub const KEYBOARD_CONFIG: [u8; 34] = [
    9, 2, 34, 0, 1, 1, 0, 0xA0, 50,
    9, 4, 0, 0, 1, 3, 1, 1, 0,
    9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0,
    7, 5, 0x81, 3, 8, 0, 10,
];

pub const VENDOR: u16 = 0x1234;
pub const PRODUCT: u16 = 0x5678;

/// The device plugged into one root hub port of a [SimController].
#[derive(Clone, Debug)]
pub struct SimDevice {
    /// Zero-based root hub port.
    pub port: usize,
    /// Protocol speed id reported in PORTSC.
    pub speed: u8,
    pub device_descriptor: [u8; 18],
    pub configuration: Vec<u8>,
    pub report_descriptor: Vec<u8>,
    /// Stall every configuration descriptor request.
    pub stall_configuration: bool,
}

impl SimDevice {
    pub fn keyboard(port: usize, speed: u8) -> Self {
        // SuperSpeed devices give bMaxPacketSize0 as an exponent.
        let (usb, max_packet0) = if speed == 4 {
            (0x0320u16, 9)
        } else {
            (0x0200u16, 64)
        };
        let mut device_descriptor = [0u8; 18];
        device_descriptor[0] = 18;
        device_descriptor[1] = 1;
        device_descriptor[2..4].copy_from_slice(&usb.to_le_bytes());
        device_descriptor[7] = max_packet0;
        device_descriptor[8..10].copy_from_slice(&VENDOR.to_le_bytes());
        device_descriptor[10..12].copy_from_slice(&PRODUCT.to_le_bytes());
        device_descriptor[12..14].copy_from_slice(&0x0100u16.to_le_bytes());
        device_descriptor[14] = 1;
        device_descriptor[15] = 2;
        device_descriptor[16] = 3;
        device_descriptor[17] = 1;

        Self {
            port,
            speed,
            device_descriptor,
            configuration: KEYBOARD_CONFIG.to_vec(),
            report_descriptor: KEYBOARD_REPORT.to_vec(),
            stall_configuration: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddressDevice {
    pub slot: u8,
    pub bsr: bool,
    pub add_flags: u32,
    pub ep0: EndpointContext,
}

#[derive(Clone, Debug)]
pub struct ConfigureEndpoint {
    pub slot: u8,
    pub add_flags: u32,
    pub endpoints: Vec<(u8, EndpointContext)>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataTrb {
    pub first: bool,
    pub length: u32,
    pub td_size: u8,
}

/// What the controller saw, in order.
#[derive(Clone, Debug, Default)]
pub struct SimLog {
    pub commands: Vec<TrbType>,
    pub address_device: Vec<AddressDevice>,
    pub configure_endpoint: Vec<ConfigureEndpoint>,
    pub setups: Vec<(u8, Setup)>,
    pub data_trbs: Vec<DataTrb>,
    /// Bytes the host sent in OUT data stages.
    pub written: Vec<u8>,
    pub port_resets: Vec<usize>,
    pub controller_resets: usize,
    pub events: usize,
    pub interrupts: usize,
    pub link_trbs_followed: usize,
}

impl SimLog {
    pub fn count(&self, ty: TrbType) -> usize {
        self.commands.iter().filter(|&&cmd| cmd == ty).count()
    }
}

/// A [DmaAllocator] over the global allocator, that the simulated controller also reads and
/// writes by physical address.
#[derive(Default)]
pub struct HeapDma {
    live: Mutex<Vec<(usize, usize)>>,
}

impl HeapDma {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn ptr(&self, phys: u64) -> *mut u8 {
        match self.phys_to_virt(phys) {
            Some(virt) => virt.as_ptr(),
            None => panic!("controller access to unmapped address {:#x}", phys),
        }
    }

    pub fn read32(&self, phys: u64) -> u32 {
        unsafe { dma::read32(self.ptr(phys)) }
    }
    pub fn write32(&self, phys: u64, value: u32) {
        unsafe { dma::write32(self.ptr(phys), value) }
    }
    pub fn read64(&self, phys: u64) -> u64 {
        unsafe { dma::read64(self.ptr(phys)) }
    }
    pub fn write64(&self, phys: u64, value: u64) {
        unsafe { dma::write64(self.ptr(phys), value) }
    }

    pub fn read_bytes(&self, phys: u64, buf: &mut [u8]) {
        let ptr = self.ptr(phys);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { ptr.add(i).read_volatile() };
        }
    }
    pub fn write_bytes(&self, phys: u64, buf: &[u8]) {
        let ptr = self.ptr(phys);
        for (i, byte) in buf.iter().enumerate() {
            unsafe { ptr.add(i).write_volatile(*byte) };
        }
    }

    pub fn read_context(&self, phys: u64) -> [u8; 32] {
        let mut raw = [0u8; 32];
        self.read_bytes(phys, &mut raw);
        raw
    }

    pub fn read_trb(&self, phys: u64) -> Trb {
        let control = self.read32(phys + TRB_CONTROL_OFFSET as u64);
        Trb::new(
            self.read64(phys + TRB_PARAM_OFFSET as u64),
            self.read32(phys + TRB_STATUS_OFFSET as u64),
            control,
        )
    }

    // Control goes last, its cycle bit hands the TRB over.
    pub fn write_trb(&self, phys: u64, trb: &Trb) {
        self.write64(phys + TRB_PARAM_OFFSET as u64, trb.param());
        self.write32(phys + TRB_STATUS_OFFSET as u64, trb.status());
        self.write32(phys + TRB_CONTROL_OFFSET as u64, trb.control());
    }
}

impl DmaAllocator for HeapDma {
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<(NonNull<u8>, u64)> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        self.live
            .lock()
            .unwrap()
            .push((virt.as_ptr() as usize, size.max(1)));
        Some((virt, virt.as_ptr() as u64 + PHYS_OFFSET))
    }

    unsafe fn free(&self, virt: NonNull<u8>, size: usize, align: usize) {
        self.live
            .lock()
            .unwrap()
            .retain(|&(base, _)| base != virt.as_ptr() as usize);
        alloc::dealloc(
            virt.as_ptr(),
            Layout::from_size_align_unchecked(size.max(1), align),
        );
    }

    fn phys_to_virt(&self, phys: u64) -> Option<NonNull<u8>> {
        let virt = phys.checked_sub(PHYS_OFFSET)? as usize;
        self.live
            .lock()
            .unwrap()
            .iter()
            .find(|&&(base, size)| virt >= base && virt < base + size)
            .and_then(|_| NonNull::new(virt as *mut u8))
    }
}

struct ControlState {
    setup: Setup,
    response: Vec<u8>,
    code: TrbCompletionCode,
    offset: usize,
    short: bool,
}

struct IrqLine {
    irq: u8,
    parameter: usize,
    chip: Arc<dyn IrqChip>,
}

struct SimState {
    regs: Vec<u32>,
    cmd_dequeue: u64,
    cmd_ccs: bool,
    /// Base and size in TRBs of the event ring segment.
    event_segment: Option<(u64, usize)>,
    event_index: usize,
    event_pcs: bool,
    next_slot: u8,
    /// Dequeue pointer and cycle state of the default control endpoint, by slot.
    ep0: BTreeMap<u8, (u64, bool)>,
    control: BTreeMap<u8, ControlState>,
    pending_irq: bool,
    log: SimLog,
}

impl SimState {
    fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }
    fn set(&mut self, offset: usize, value: u32) {
        self.regs[offset / 4] = value;
    }
    fn reg64(&self, offset: usize) -> u64 {
        u64::from(self.reg(offset)) | (u64::from(self.reg(offset + 4)) << 32)
    }
    fn set64(&mut self, offset: usize, value: u64) {
        self.set(offset, value as u32);
        self.set(offset + 4, (value >> 32) as u32);
    }
    fn running(&self) -> bool {
        self.reg(USBCMD) & USB_CMD_RS != 0
    }

    fn take_interrupt(&mut self) -> bool {
        let deliver = self.pending_irq
            && self.reg(USBCMD) & USB_CMD_INTE != 0
            && self.reg(IMAN) & IMAN_IE != 0;
        if deliver {
            self.pending_irq = false;
            self.log.interrupts += 1;
        }
        deliver
    }
}

pub struct SimController {
    bar: u64,
    dma: Arc<HeapDma>,
    device: Option<SimDevice>,
    state: Mutex<SimState>,
    irq: Mutex<Option<IrqLine>>,
}

impl SimController {
    pub fn new(bar: u64, dma: Arc<HeapDma>, device: Option<SimDevice>) -> Arc<Self> {
        let mut st = SimState {
            regs: vec![0; WINDOW_DWORDS],
            cmd_dequeue: 0,
            cmd_ccs: true,
            event_segment: None,
            event_index: 0,
            event_pcs: true,
            next_slot: 1,
            ep0: BTreeMap::new(),
            control: BTreeMap::new(),
            pending_irq: false,
            log: SimLog::default(),
        };

        st.set(0x00, CAPLENGTH as u32 | (HCIVERSION << 16));
        st.set(0x04, ((MAX_PORTS as u32) << 24) | (1 << 8) | u32::from(MAX_SLOTS));
        st.set(0x08, SCRATCHPADS << 27);
        st.set(0x10, (((XECP / 4) as u32) << 16) | 1);
        st.set(0x14, DBOFF as u32);
        st.set(0x18, RTSOFF as u32);

        st.set(USBSTS, USB_STS_HCH);
        st.set(PAGESIZE, 1);

        // Legacy support owned by the firmware, then USB 3 on ports 1-2 and USB 2 on ports 3-4.
        st.set(LEGACY, 1 | (4 << 8) | LEGACY_BIOS_OWNED);
        st.set(USB3_PROTOCOL, 2 | (4 << 8) | (3 << 24));
        st.set(USB3_PROTOCOL + 8, 1 | (2 << 8));
        st.set(USB2_PROTOCOL, 2 | (2 << 24));
        st.set(USB2_PROTOCOL + 8, 3 | (2 << 8));

        // The last port starts unpowered.
        for port in 0..MAX_PORTS - 1 {
            st.set(portsc(port), PortFlags::PP.bits());
        }
        if let Some(device) = &device {
            let flags = PortFlags::PP | PortFlags::CCS | PortFlags::CSC;
            st.set(
                portsc(device.port),
                flags.bits() | (u32::from(device.speed) << 10),
            );
        }

        Arc::new(Self {
            bar,
            dma,
            device,
            state: Mutex::new(st),
            irq: Mutex::new(None),
        })
    }

    pub fn log(&self) -> SimLog {
        self.state.lock().unwrap().log.clone()
    }

    pub fn register(&self, offset: usize) -> u32 {
        self.state.lock().unwrap().reg(offset)
    }

    pub fn portsc(&self, port: usize) -> PortFlags {
        PortFlags::from_bits_truncate(self.register(portsc(port)))
    }

    pub fn halted(&self) -> bool {
        self.register(USBSTS) & USB_STS_HCH != 0
    }

    pub fn legacy_owned_by_os(&self) -> bool {
        self.register(LEGACY) & (LEGACY_BIOS_OWNED | LEGACY_OS_OWNED) == LEGACY_OS_OWNED
    }

    pub fn dcbaa_entry(&self, slot: u8) -> u64 {
        let dcbaap = self.state.lock().unwrap().reg64(DCBAAP);
        self.dma.read64(dcbaap + u64::from(slot) * 8)
    }

    /// The slot context the controller keeps in the output device context of `slot`.
    pub fn slot_context(&self, slot: u8) -> SlotContext {
        SlotContext::from_bytes(self.dma.read_context(self.dcbaa_entry(slot)))
    }

    pub fn endpoint_context(&self, slot: u8, dci: u8) -> EndpointContext {
        let output = self.dcbaa_entry(slot);
        EndpointContext::from_bytes(
            self.dma
                .read_context(output + u64::from(dci) * CONTEXT_SIZE),
        )
    }

    fn write(&self, offset: usize, value: u64, width: usize) {
        let interrupt = {
            let mut st = self.state.lock().unwrap();
            self.write_locked(&mut st, offset, value, width);
            st.take_interrupt()
        };
        if interrupt {
            self.interrupt();
        }
    }

    fn interrupt(&self) {
        let line = self
            .irq
            .lock()
            .unwrap()
            .as_ref()
            .map(|line| (line.irq, line.parameter, Arc::clone(&line.chip)));
        if let Some((irq, parameter, chip)) = line {
            chip.handle(irq, parameter, &InterruptFrame::default());
        }
    }

    fn write_locked(&self, st: &mut SimState, offset: usize, value: u64, width: usize) {
        let dword = value as u32;
        match offset {
            USBCMD => {
                let mut cmd = dword;
                if cmd & USB_CMD_HCRST != 0 {
                    cmd = 0;
                    st.log.controller_resets += 1;
                    st.event_segment = None;
                    st.control.clear();
                }
                st.set(USBCMD, cmd);
                let sts = st.reg(USBSTS);
                if cmd & USB_CMD_RS != 0 {
                    st.set(USBSTS, sts & !USB_STS_HCH);
                } else {
                    st.set(USBSTS, sts | USB_STS_HCH);
                }
            }
            USBSTS => {
                let rw1c = USB_STS_HSE | USB_STS_EINT | USB_STS_PCD | USB_STS_SRE;
                st.set(USBSTS, st.reg(USBSTS) & !(dword & rw1c));
            }
            CRCR => {
                st.cmd_dequeue = value & !0x3F;
                st.cmd_ccs = value & 1 != 0;
                st.set64(CRCR, value);
            }
            IMAN => {
                let ip = st.reg(IMAN) & IMAN_IP & !(dword & IMAN_IP);
                st.set(IMAN, (dword & IMAN_IE) | ip);
            }
            ERSTBA => {
                st.set64(ERSTBA, value);
                let base = self.dma.read64(value);
                let size = self.dma.read32(value + 8) as usize;
                st.event_segment = Some((base, size));
                st.event_index = 0;
                st.event_pcs = true;
            }
            ERDP => {
                let ehb = st.reg64(ERDP) & ERDP_EHB & !(value & ERDP_EHB);
                st.set64(ERDP, (value & !0xF) | ehb);
            }
            LEGACY => {
                let mut legacy = dword;
                if legacy & LEGACY_OS_OWNED != 0 {
                    legacy &= !LEGACY_BIOS_OWNED;
                }
                st.set(LEGACY, legacy);
            }
            o if o >= PORTSC && o < portsc(MAX_PORTS) && (o - PORTSC) % 0x10 == 0 => {
                self.write_portsc(st, (o - PORTSC) / 0x10, dword);
            }
            o if o >= DBOFF && o < DBOFF + 256 * 4 => {
                let target = ((o - DBOFF) / 4) as u8;
                if target == 0 {
                    self.run_commands(st);
                } else if dword == 1 {
                    self.run_control(st, target);
                }
            }
            o if width == 8 => st.set64(o, value),
            o => st.set(o, dword),
        }
    }

    fn write_portsc(&self, st: &mut SimState, port: usize, value: u32) {
        let rw1c = PortFlags::CHANGE_BITS | PortFlags::WRC | PortFlags::CEC;
        let mut flags = st.reg(portsc(port)) & !(value & rw1c.bits());

        if value & PortFlags::PP.bits() != 0 {
            flags |= PortFlags::PP.bits();
        }
        if value & (PortFlags::PR | PortFlags::WPR).bits() != 0 {
            st.log.port_resets.push(port);
            flags |= PortFlags::PRC.bits();
            if value & PortFlags::WPR.bits() != 0 {
                flags |= PortFlags::WRC.bits();
            }
            let connected = flags & (PortFlags::CCS | PortFlags::PP).bits()
                == (PortFlags::CCS | PortFlags::PP).bits();
            if connected {
                flags |= PortFlags::PED.bits();
            } else {
                flags &= !PortFlags::PED.bits();
            }
        }
        st.set(portsc(port), flags);
    }

    fn post_event(&self, st: &mut SimState, event: Trb) {
        let (base, size) = st
            .event_segment
            .expect("event posted before the event ring was programmed");

        let mut event = event;
        event.set_cycle(st.event_pcs);
        self.dma
            .write_trb(base + (st.event_index * TRB_SIZE) as u64, &event);
        st.event_index += 1;
        if st.event_index == size {
            st.event_index = 0;
            st.event_pcs = !st.event_pcs;
        }

        st.log.events += 1;
        let iman = st.reg(IMAN);
        if iman & IMAN_IE != 0 {
            st.set(IMAN, iman | IMAN_IP);
        }
        st.set64(ERDP, st.reg64(ERDP) | ERDP_EHB);
        st.set(USBSTS, st.reg(USBSTS) | USB_STS_EINT);
        st.pending_irq = true;
    }

    fn run_commands(&self, st: &mut SimState) {
        if !st.running() {
            return;
        }

        for _ in 0..4096 {
            let trb = self.dma.read_trb(st.cmd_dequeue);
            if trb.cycle() != st.cmd_ccs {
                return;
            }
            if trb.is_type(TrbType::Link) {
                if trb.control() & TRB_CONTROL_TOGGLE_CYCLE_BIT != 0 {
                    st.cmd_ccs = !st.cmd_ccs;
                }
                st.cmd_dequeue = trb.param();
                st.log.link_trbs_followed += 1;
                continue;
            }

            let (code, slot) = self.execute(st, &trb);
            let event = Trb::new(
                st.cmd_dequeue,
                (code as u32) << 24,
                (u32::from(slot) << 24) | ((TrbType::CommandCompletion as u32) << 10),
            );
            self.post_event(st, event);
            st.cmd_dequeue += TRB_SIZE as u64;
        }
        panic!("command ring never ran dry");
    }

    fn output_context(&self, st: &SimState, slot: u8) -> Option<u64> {
        if slot == 0 || slot >= st.next_slot {
            return None;
        }
        match self.dma.read64(st.reg64(DCBAAP) + u64::from(slot) * 8) {
            0 => None,
            output => Some(output),
        }
    }

    fn execute(&self, st: &mut SimState, trb: &Trb) -> (TrbCompletionCode, u8) {
        let ty = trb.trb_type();
        let slot = trb.event_slot();

        if ty == TrbType::EnableSlot as u8 {
            st.log.commands.push(TrbType::EnableSlot);
            if st.next_slot > MAX_SLOTS {
                return (TrbCompletionCode::NoSlotsAvailable, 0);
            }
            st.next_slot += 1;
            (TrbCompletionCode::Success, st.next_slot - 1)
        } else if ty == TrbType::AddressDevice as u8 {
            st.log.commands.push(TrbType::AddressDevice);
            let output = match self.output_context(st, slot) {
                Some(output) => output,
                None => return (TrbCompletionCode::SlotNotEnabled, slot),
            };
            let input = trb.param();
            let bsr = trb.control() & (1 << 9) != 0;

            let mut slot_ctx = SlotContext::from_bytes(self.dma.read_context(input + CONTEXT_SIZE));
            let mut ep0 =
                EndpointContext::from_bytes(self.dma.read_context(input + 2 * CONTEXT_SIZE));
            if bsr {
                slot_ctx.set_slot_state_raw(SlotState::Default as u8);
                slot_ctx.set_device_address(0);
            } else {
                slot_ctx.set_slot_state_raw(SlotState::Addressed as u8);
                slot_ctx.set_device_address(slot);
            }
            ep0.set_state(EndpointState::Running as u8);
            self.dma.write_bytes(output, slot_ctx.as_bytes());
            self.dma.write_bytes(output + CONTEXT_SIZE, ep0.as_bytes());

            let dequeue = ep0.dequeue();
            st.ep0.insert(slot, (dequeue & !0xF, dequeue & 1 != 0));
            st.log.address_device.push(AddressDevice {
                slot,
                bsr,
                add_flags: self.dma.read32(input + 4),
                ep0,
            });
            (TrbCompletionCode::Success, slot)
        } else if ty == TrbType::ConfigureEndpoint as u8 {
            st.log.commands.push(TrbType::ConfigureEndpoint);
            let output = match self.output_context(st, slot) {
                Some(output) => output,
                None => return (TrbCompletionCode::SlotNotEnabled, slot),
            };
            let input = trb.param();
            let add_flags = self.dma.read32(input + 4);

            let address = SlotContext::from_bytes(self.dma.read_context(output)).device_address();
            let mut slot_ctx = SlotContext::from_bytes(self.dma.read_context(input + CONTEXT_SIZE));
            slot_ctx.set_slot_state_raw(SlotState::Configured as u8);
            slot_ctx.set_device_address(address);
            self.dma.write_bytes(output, slot_ctx.as_bytes());

            let mut endpoints = Vec::new();
            for dci in 2..32u8 {
                if add_flags & (1 << dci) == 0 {
                    continue;
                }
                let mut ep = EndpointContext::from_bytes(
                    self.dma
                        .read_context(input + (u64::from(dci) + 1) * CONTEXT_SIZE),
                );
                ep.set_state(EndpointState::Running as u8);
                self.dma
                    .write_bytes(output + u64::from(dci) * CONTEXT_SIZE, ep.as_bytes());
                endpoints.push((dci, ep));
            }
            st.log.configure_endpoint.push(ConfigureEndpoint {
                slot,
                add_flags,
                endpoints,
            });
            (TrbCompletionCode::Success, slot)
        } else {
            st.log.commands.push(TrbType::NoOpCmd);
            (TrbCompletionCode::Success, slot)
        }
    }

    fn run_control(&self, st: &mut SimState, slot: u8) {
        if !st.running() {
            return;
        }
        let (mut dequeue, mut ccs) = match st.ep0.get(&slot) {
            Some(&cursor) => cursor,
            None => return,
        };

        for _ in 0..4096 {
            let trb = self.dma.read_trb(dequeue);
            if trb.cycle() != ccs {
                st.ep0.insert(slot, (dequeue, ccs));
                return;
            }
            if trb.is_type(TrbType::Link) {
                if trb.control() & TRB_CONTROL_TOGGLE_CYCLE_BIT != 0 {
                    ccs = !ccs;
                }
                dequeue = trb.param();
                st.log.link_trbs_followed += 1;
                continue;
            }
            self.transfer(st, slot, &trb);
            dequeue += TRB_SIZE as u64;
        }
        panic!("transfer ring never ran dry");
    }

    fn transfer(&self, st: &mut SimState, slot: u8, trb: &Trb) {
        if trb.is_type(TrbType::SetupStage) {
            let param = trb.param();
            let setup = Setup {
                kind: param as u8,
                request: (param >> 8) as u8,
                value: (param >> 16) as u16,
                index: (param >> 32) as u16,
                length: (param >> 48) as u16,
            };
            st.log.setups.push((slot, setup));
            let (response, code) = self.respond(&setup);
            st.control.insert(
                slot,
                ControlState {
                    setup,
                    response,
                    code,
                    offset: 0,
                    short: false,
                },
            );
        } else if trb.is_type(TrbType::DataStage) || trb.is_type(TrbType::Normal) {
            let length = trb.transfer_length();
            st.log.data_trbs.push(DataTrb {
                first: trb.is_type(TrbType::DataStage),
                length,
                td_size: trb.td_size(),
            });

            let ctl = match st.control.get_mut(&slot) {
                Some(ctl) => ctl,
                None => return,
            };
            let length = length as usize;
            if ctl.setup.kind & 0x80 != 0 {
                let start = ctl.offset.min(ctl.response.len());
                let end = (ctl.offset + length).min(ctl.response.len());
                self.dma.write_bytes(trb.param(), &ctl.response[start..end]);
                if end - start < length {
                    ctl.short = true;
                }
            } else {
                let mut buf = vec![0u8; length];
                self.dma.read_bytes(trb.param(), &mut buf);
                st.log.written.extend_from_slice(&buf);
            }
            ctl.offset += length;
        } else if trb.is_type(TrbType::EventData) {
            let code = match st.control.get(&slot) {
                Some(ctl) if ctl.code != TrbCompletionCode::Success => ctl.code,
                Some(ctl) if ctl.short => TrbCompletionCode::ShortPacket,
                _ => TrbCompletionCode::Success,
            };
            let event = Trb::new(
                trb.param(),
                (code as u32) << 24,
                (u32::from(slot) << 24)
                    | (1 << 16)
                    | ((TrbType::Transfer as u32) << 10)
                    | TRB_CONTROL_EVENT_DATA_BIT,
            );
            self.post_event(st, event);
        }
    }

    fn respond(&self, setup: &Setup) -> (Vec<u8>, TrbCompletionCode) {
        let device = match &self.device {
            Some(device) => device,
            None => return (Vec::new(), TrbCompletionCode::UsbTransaction),
        };
        let value = setup.value;
        let descriptor = (value >> 8) as u8;

        let mut response = match (setup.kind, setup.request) {
            (0x80, 6) if descriptor == 1 => device.device_descriptor.to_vec(),
            (0x80, 6) if descriptor == 2 && !device.stall_configuration => {
                device.configuration.clone()
            }
            (0x81, 6) if descriptor == 0x22 => device.report_descriptor.clone(),
            (0x00, 9) | (0x21, 0x0A) => Vec::new(),
            _ => return (Vec::new(), TrbCompletionCode::Stall),
        };
        response.truncate(usize::from(setup.length));
        (response, TrbCompletionCode::Success)
    }
}

/// The register window of a [SimController], as handed to the driver.
pub struct SimWindow(Arc<SimController>);

impl Io for SimWindow {
    fn read8(&self, offset: usize) -> u8 {
        (self.read32(offset & !3) >> ((offset & 3) * 8)) as u8
    }
    fn read16(&self, offset: usize) -> u16 {
        (self.read32(offset & !3) >> ((offset & 2) * 8)) as u16
    }
    fn read32(&self, offset: usize) -> u32 {
        self.0.register(offset)
    }
    fn read64(&self, offset: usize) -> u64 {
        self.0.state.lock().unwrap().reg64(offset)
    }
    fn write32(&self, offset: usize, value: u32) {
        self.0.write(offset, u64::from(value), 4)
    }
    fn write64(&self, offset: usize, value: u64) {
        self.0.write(offset, value, 8)
    }
}

pub struct SimPci {
    bar: u64,
    config: Mutex<BTreeMap<u16, u32>>,
    pub msi_irq: Mutex<Option<u8>>,
    pub msi_enabled: AtomicBool,
    pub bus_master: AtomicBool,
}

impl SimPci {
    pub fn new(bar: u64) -> Arc<Self> {
        Arc::new(Self {
            bar,
            config: Mutex::new(BTreeMap::new()),
            msi_irq: Mutex::new(None),
            msi_enabled: AtomicBool::new(false),
            bus_master: AtomicBool::new(false),
        })
    }

    pub fn config(&self, offset: u16) -> u32 {
        self.read_config(offset)
    }
}

impl PciFunction for SimPci {
    fn vendor_id(&self) -> u16 {
        0x1B36
    }
    fn device_id(&self) -> u16 {
        0x000D
    }
    fn revision(&self) -> u8 {
        1
    }
    fn bar0(&self) -> u64 {
        // 64-bit memory BAR flags in the low bits.
        self.bar | 0x4
    }
    fn enable_memory_and_bus_master(&self) {
        self.bus_master.store(true, Ordering::SeqCst);
    }
    fn read_config(&self, offset: u16) -> u32 {
        self.config
            .lock()
            .unwrap()
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }
    fn write_config(&self, offset: u16, value: u32) {
        self.config.lock().unwrap().insert(offset, value);
    }
    fn install_msi(&self, irq: u8) -> Result<()> {
        *self.msi_irq.lock().unwrap() = Some(irq);
        Ok(())
    }
    fn start_msi(&self) {
        self.msi_enabled.store(true, Ordering::SeqCst);
    }
    fn stop_msi(&self) {
        self.msi_enabled.store(false, Ordering::SeqCst);
    }
}

/// One simulated controller per BAR, sharing a heap allocator.
pub struct SimPlatform {
    dma: Arc<HeapDma>,
    controllers: Vec<Arc<SimController>>,
    last_mapped: Mutex<Option<Arc<SimController>>>,
    pub registrations: Mutex<Vec<(u8, String, usize)>>,
    pub fail_irq_register: AtomicBool,
}

impl SimPlatform {
    /// Controller `i` sits at `BAR0 + i * BAR_STRIDE`, with `devices[i]` plugged in.
    pub fn new(devices: Vec<Option<SimDevice>>) -> Arc<Self> {
        let dma = HeapDma::new();
        let controllers = devices
            .into_iter()
            .enumerate()
            .map(|(i, device)| {
                SimController::new(BAR0 + i as u64 * BAR_STRIDE, Arc::clone(&dma), device)
            })
            .collect();
        Arc::new(Self {
            dma,
            controllers,
            last_mapped: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
            fail_irq_register: AtomicBool::new(false),
        })
    }

    pub fn with_device(device: SimDevice) -> Arc<Self> {
        Self::new(vec![Some(device)])
    }

    pub fn sim(&self, i: usize) -> &Arc<SimController> {
        &self.controllers[i]
    }

    pub fn pci(&self, i: usize) -> Arc<SimPci> {
        SimPci::new(self.controllers[i].bar)
    }

    pub fn heap(&self) -> &Arc<HeapDma> {
        &self.dma
    }
}

impl Platform for SimPlatform {
    fn map_registers(&self, phys: u64, len: usize) -> Result<Box<dyn Io>> {
        assert!(len <= WINDOW_DWORDS * 4);
        let sim = self
            .controllers
            .iter()
            .find(|sim| sim.bar == phys)
            .ok_or(XhciError::Invalid("BAR"))?;
        *self.last_mapped.lock().unwrap() = Some(Arc::clone(sim));
        Ok(Box::new(SimWindow(Arc::clone(sim))))
    }

    fn dma(&self) -> Arc<dyn DmaAllocator> {
        Arc::clone(&self.dma) as Arc<dyn DmaAllocator>
    }

    fn delay(&self, _duration: Duration) {
        std::thread::yield_now();
    }

    fn irq_register(&self, irq: u8, registration: IrqRegistration) -> Result<()> {
        if self.fail_irq_register.load(Ordering::SeqCst) {
            return Err(XhciError::Io);
        }
        let sim = self
            .last_mapped
            .lock()
            .unwrap()
            .clone()
            .ok_or(XhciError::NoController)?;

        registration.chip.install(irq, &registration.info)?;
        *sim.irq.lock().unwrap() = Some(IrqLine {
            irq,
            parameter: registration.parameter,
            chip: Arc::clone(&registration.chip),
        });
        self.registrations.lock().unwrap().push((
            irq,
            registration.name.clone(),
            registration.parameter,
        ));
        registration.chip.enable(irq);
        Ok(())
    }
}

/// The embedded configuration, with rings small enough that every one of them wraps during a
/// single enumeration.
pub fn small_rings() -> XhciConfig {
    let mut config = XHCI_CONFIG.clone();
    config.rings.command_trbs = 4;
    config.rings.transfer_trbs = 8;
    config.rings.event_trbs = 4;
    config
}

pub struct Harness {
    pub platform: Arc<SimPlatform>,
    pub controllers: Arc<XhciControllers>,
    pub reports: Receiver<HidReport>,
}

impl Harness {
    pub fn new(platform: Arc<SimPlatform>, config: XhciConfig) -> Self {
        xhci_hcd::config::setup_logging(&config);
        let (sender, reports) = crossbeam_channel::unbounded();
        let controllers = XhciControllers::new(
            Arc::clone(&platform) as Arc<dyn Platform>,
            config,
            Some(sender),
        );
        Self {
            platform,
            controllers,
            reports,
        }
    }

    /// Bring up simulated controller `i`.
    pub fn init(&self, i: usize) -> Result<usize> {
        let pci = self.platform.pci(i);
        self.controllers.xhci_init(pci as Arc<dyn PciFunction>)
    }
}
