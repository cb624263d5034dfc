//! The eXtensible Host Controller Interface (XHCI) Module
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! The standard can be found [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).
//! The standard is referenced frequently throughout this documentation as "XHCI".
//!
//! One [Xhci] drives one controller. Bring-up is split in two: [Xhci::new] maps the registers and
//! allocates every structure the controller will be pointed at, [Xhci::init] resets the controller
//! and programs it. Scheduling and port enumeration start later, when the interrupt line is
//! enabled (see [controllers]).
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use common::dma::DmaAllocator;
use common::io::Io;
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::config::XhciConfig;
use crate::platform::{PciFunction, Platform};
use crate::usb;
use crate::{Result, XhciError};

pub mod capability;
pub mod command;
pub mod context;
pub mod controllers;
pub mod device_enumerator;
pub mod doorbell;
pub mod event;
pub mod extended;
pub mod irq_reactor;
pub mod operational;
pub mod port;
pub mod ring;
pub mod runtime;
pub mod transfer;
pub mod trb;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::capability::CapabilityRegs;
pub use self::controllers::XhciControllers;
use self::context::{DeviceContext, DeviceContextBaseAddressArray, ScratchpadBufferArray};
use self::doorbell::Doorbells;
use self::event::EventRing;
use self::operational::*;
use self::port::{pair_ports, PortInfo, PortRegs, PortSpeed};
use self::ring::{Ring, RING_ALIGN};
use self::runtime::{Interrupter, ERDP_EHB, IMAN_IE, IMAN_IP};

/// Size of the register window mapped from BAR0.
pub const MMIO_WINDOW_SIZE: usize = 0x10000;

/// PCI configuration offset of the Frame Length Adjustment register.
const PCI_FLADJ: u16 = 0x60;
const PCI_FLADJ_DEFAULT: u32 = 0x20 << 8;

const INTEL_VENDOR_ID: u16 = 0x8086;
const PANTHER_POINT_DEVICE_ID: u16 = 0x1E31;
const PANTHER_POINT_REVISION: u8 = 4;
/// USB 3.0 Port SuperSpeed Enable and USB 2.0 Port Routing of Intel chipsets.
const PCI_INTEL_USB3_PSSEN: u16 = 0xD8;
const PCI_INTEL_XUSB2PR: u16 = 0xD0;

/// A HID report descriptor fetched while configuring a port, on its way to the HID class driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HidReport {
    pub controller: usize,
    /// Zero-based root hub port.
    pub port: usize,
    pub slot: u8,
    pub interface: u8,
    pub descriptor: Vec<u8>,
}

/// What the driver knows about the device behind one root hub port.
#[derive(Default)]
pub struct PortState {
    /// Device slot, 0 when none is assigned.
    pub slot: u8,
    pub speed: Option<PortSpeed>,
    /// Max packet size of the default control endpoint, derived from the port speed.
    pub control_max_packet: u16,
    pub dev_desc: Option<usb::DeviceDescriptor>,
    pub device_context: Option<DeviceContext>,
    /// Transfer rings by device context index.
    pub rings: BTreeMap<u8, Ring>,
}

pub struct Xhci {
    id: usize,
    /// The Host Controller Interface Capability Registers, read once. (See XHCI section 5.3)
    cap: CapabilityRegs,
    /// BAR0, holding every register set of the controller.
    io: Box<dyn Io>,

    pci: Arc<dyn PciFunction>,
    platform: Arc<dyn Platform>,
    dma: Arc<dyn DmaAllocator>,
    config: XhciConfig,

    page_size: usize,
    dcbaa: DeviceContextBaseAddressArray,
    scratchpad_buf_arr: Option<ScratchpadBufferArray>,

    /// The command ring. Held for the whole of a command, which serializes submissions.
    cmd: Mutex<Ring>,
    /// Where the command ring lives, for matching completions without taking `cmd`.
    cmd_span: Range<u64>,
    /// Only ever locked by the interrupt handler.
    primary_event_ring: Mutex<EventRing>,

    ports: Mutex<Vec<PortInfo>>,
    port_states: Vec<Mutex<PortState>>,

    hid_reports: Option<Sender<HidReport>>,
}

impl Xhci {
    /// Map the controller and allocate its data structures. Nothing is written to the controller
    /// yet, apart from PCI configuration quirks.
    pub fn new(
        id: usize,
        pci: Arc<dyn PciFunction>,
        platform: Arc<dyn Platform>,
        config: XhciConfig,
        hid_reports: Option<Sender<HidReport>>,
    ) -> Result<Xhci> {
        pci.enable_memory_and_bus_master();

        let io = platform.map_registers(pci.bar0() & !0xF, MMIO_WINDOW_SIZE)?;
        let cap = CapabilityRegs::read(&*io);
        debug!("xHCI {}: {:X?}", id, cap);

        if cap.hci_ver < capability::MIN_HCI_VERSION {
            warn!(
                "Unsupported/Unknowned xHCI controller version: {:#06x}. This may cause unexpected behavior.",
                cap.hci_ver
            );
        }

        {
            // Write to the FLADJ register incase the BIOS didn't
            let fladj = pci.read_config(PCI_FLADJ);
            pci.write_config(PCI_FLADJ, fladj | PCI_FLADJ_DEFAULT);
        }
        if pci.vendor_id() == INTEL_VENDOR_ID
            && pci.device_id() == PANTHER_POINT_DEVICE_ID
            && pci.revision() == PANTHER_POINT_REVISION
        {
            debug!("xHCI {}: Panther Point, routing all ports to xHCI", id);
            pci.write_config(PCI_INTEL_USB3_PSSEN, 0xFFFF_FFFF);
            pci.write_config(PCI_INTEL_XUSB2PR, 0xFFFF_FFFF);
        }

        let dma = platform.dma();
        let op = OperationalRegs::new(&*io, usize::from(cap.len));
        let page_size = op.page_size_bytes().max(common::PAGE_SIZE);

        let protocols = extended::supported_protocols(&*io, cap.ext_caps_offset());
        let max_ports = usize::from(cap.max_ports()).min(config.limits.max_root_ports);
        let ports = pair_ports(&protocols, max_ports);

        let dcbaa = DeviceContextBaseAddressArray::new(&dma)?;

        let buf_count = cap.max_scratchpad_bufs();
        let scratchpad_buf_arr = if buf_count > 0 {
            let scratchpad = ScratchpadBufferArray::new(&dma, buf_count, page_size)?;
            dcbaa.set(0, scratchpad.register());
            debug!(
                "Setting up {} scratchpads, at {:#0x}",
                buf_count,
                scratchpad.register()
            );
            Some(scratchpad)
        } else {
            None
        };

        let cmd = Ring::new(&dma, config.rings.command_trbs)?;
        let primary_event_ring = EventRing::new(&dma, config.rings.event_trbs)?;

        let port_states = (0..max_ports)
            .map(|_| Mutex::new(PortState::default()))
            .collect();

        Ok(Xhci {
            id,
            cap,
            io,
            pci,
            platform,
            dma,
            config,
            page_size,
            dcbaa,
            scratchpad_buf_arr,
            cmd_span: cmd.span(),
            cmd: Mutex::new(cmd),
            primary_event_ring: Mutex::new(primary_event_ring),
            ports: Mutex::new(ports),
            port_states,
            hid_reports,
        })
    }

    /// Reset the controller, take it from the firmware and point it at the command ring, the
    /// device context array and the primary event ring.
    pub fn init(&self) -> Result<()> {
        self.hc_reset()?;

        extended::stop_legacy(
            &*self.io,
            self.cap.ext_caps_offset(),
            self.config.timeouts.legacy_handoff(),
            |d| self.platform.delay(d),
        )?;

        let op = self.op();

        let dcbaap = self.dcbaa.physical();
        if dcbaap % 64 != 0 {
            error!("dcbaap isn't 64 byte aligned.");
            return Err(XhciError::Misaligned("DCBAA"));
        }
        debug!("Writing DCBAAP: {:X}", dcbaap);
        op.dcbaap().write(dcbaap);

        let crcr = self.cmd.lock().register();
        if (crcr & !CRCR_RCS_BIT) % RING_ALIGN as u64 != 0 {
            error!("cmd ring isn't 64 byte aligned.");
            return Err(XhciError::Misaligned("command ring"));
        }
        debug!("Writing CRCR: {:X}", crcr);
        op.crcr().write(crcr);

        let max_slots = self.cap.max_slots();
        debug!("Setting enabled slots to {}.", max_slots);
        op.set_max_slots_enabled(max_slots);

        op.dn_ctrl().write(DN_CTRL_N1);

        self.init_intr();

        info!(
            "xHCI {}: initialized, version {:#06x}, {} slots, {} ports, {}-byte contexts",
            self.id,
            self.cap.hci_ver,
            max_slots,
            self.port_states.len(),
            self.cap.context_size()
        );
        Ok(())
    }

    fn init_intr(&self) {
        let ring = self.primary_event_ring.lock();
        let int = self.interrupter(0);

        debug!(
            "xHCI {}: event ring of {} TRBs, {} segment table entries supported, {} interrupters",
            self.id,
            ring.len(),
            self.cap.max_erst_entries(),
            self.cap.max_intrs()
        );

        // Enable the interrupter, and clear its pending bit.
        int.iman().write(IMAN_IP | IMAN_IE);
        int.imod().write(0);
        int.erstsz().write(1);

        let erdp = ring.erdp();
        debug!("Writing ERDP: {:X}", erdp);
        int.erdp().write(erdp | ERDP_EHB);

        let erstba = ring.erstba();
        debug!("Writing ERSTBA: {:X}", erstba);
        int.erstba().write(erstba);

        self.op()
            .usb_sts()
            .write(USB_STS_SRE | USB_STS_PCD | USB_STS_EINT | USB_STS_HSE);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cap(&self) -> &CapabilityRegs {
        &self.cap
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn dcbaa(&self) -> &DeviceContextBaseAddressArray {
        &self.dcbaa
    }

    pub fn scratchpads(&self) -> Option<&ScratchpadBufferArray> {
        self.scratchpad_buf_arr.as_ref()
    }

    pub fn pci(&self) -> &Arc<dyn PciFunction> {
        &self.pci
    }

    pub fn op(&self) -> OperationalRegs<'_> {
        OperationalRegs::new(&*self.io, usize::from(self.cap.len))
    }

    pub fn interrupter(&self, index: usize) -> Interrupter<'_> {
        Interrupter::new(&*self.io, self.cap.runtime_offset(), index)
    }

    pub fn doorbells(&self) -> Doorbells<'_> {
        Doorbells::new(&*self.io, self.cap.doorbell_offset())
    }

    pub fn port_regs(&self, port: usize) -> PortRegs<'_> {
        self.op().port(port)
    }

    pub fn port_count(&self) -> usize {
        self.port_states.len()
    }

    pub fn port_info(&self, port: usize) -> Option<PortInfo> {
        self.ports.lock().get(port).copied()
    }

    pub fn port_infos(&self) -> Vec<PortInfo> {
        self.ports.lock().clone()
    }

    /// The slot assigned to the device on `port`, 0 if none.
    pub fn port_slot(&self, port: usize) -> u8 {
        self.port_states
            .get(port)
            .map_or(0, |state| state.lock().slot)
    }

    pub fn device_descriptor(&self, port: usize) -> Option<usb::DeviceDescriptor> {
        self.port_states.get(port)?.lock().dev_desc
    }

    fn delay(&self, duration: Duration) {
        self.platform.delay(duration)
    }

    /// Halt the controller. Returns at once if it already is.
    pub fn hc_stop(&self) -> Result<()> {
        let op = self.op();
        if op.halted() {
            return Ok(());
        }

        debug!("Stopping xHC {}.", self.id);
        op.usb_cmd().write(0);

        let mut timeout = self.config.timeouts.halt();
        while !op.halted() {
            timeout.run(|d| self.delay(d)).map_err(|()| {
                error!("xHCI {}: timeout on USB_STS_HCH", self.id);
                XhciError::Timeout("USBSTS.HCH")
            })?;
        }
        Ok(())
    }

    pub fn hc_reset(&self) -> Result<()> {
        let op = self.op();
        if !op.halted() {
            self.hc_stop()?;
        }

        debug!("Reset xHC {}", self.id);
        op.usb_cmd().writef(USB_CMD_HCRST, true);

        let mut timeout = self.config.timeouts.reset();
        while op.usb_cmd().readf(USB_CMD_HCRST) || op.usb_sts().readf(USB_STS_CNR) {
            timeout.run(|d| self.delay(d)).map_err(|()| {
                error!("xHCI {}: timeout on USB_CMD_HCRST", self.id);
                XhciError::Timeout("USBCMD.HCRST")
            })?;
        }
        Ok(())
    }

    /// Set Run/Stop with interrupts and host system errors enabled.
    pub fn start_sched(&self) {
        debug!("Starting xHC {}.", self.id);
        self.op()
            .usb_cmd()
            .write(USB_CMD_RS | USB_CMD_INTE | USB_CMD_HSEE);
        self.delay(self.config.timeouts.run_settle());
    }

    pub fn stop_sched(&self) {
        debug!("Stopping the schedule of xHC {}.", self.id);
        let usb_cmd = self.op().usb_cmd();
        usb_cmd.write(usb_cmd.read() & !(USB_CMD_RS | USB_CMD_INTE));
    }
}
