use common::io::{Io, Reg32, Reg64};

use super::port::PortRegs;

pub const OP_USBCMD: usize = 0x00;
pub const OP_USBSTS: usize = 0x04;
pub const OP_PAGESIZE: usize = 0x08;
pub const OP_DNCTRL: usize = 0x14;
pub const OP_CRCR: usize = 0x18;
pub const OP_DCBAAP: usize = 0x30;
pub const OP_CONFIG: usize = 0x38;
/// Start of the port register sets, 16 bytes per root hub port.
pub const OP_PORTS: usize = 0x400;
pub const OP_PORT_STRIDE: usize = 0x10;

/// Run/Stop
pub const USB_CMD_RS: u32 = 1 << 0;
/// Host Controller Reset
pub const USB_CMD_HCRST: u32 = 1 << 1;
/// Interrupter Enable
pub const USB_CMD_INTE: u32 = 1 << 2;
/// Host System Error Enable
pub const USB_CMD_HSEE: u32 = 1 << 3;

/// HC Halted
pub const USB_STS_HCH: u32 = 1 << 0;
/// Host System Error
pub const USB_STS_HSE: u32 = 1 << 2;
/// Event Interrupt
pub const USB_STS_EINT: u32 = 1 << 3;
/// Port Change Detect
pub const USB_STS_PCD: u32 = 1 << 4;
/// Save/Restore Error
pub const USB_STS_SRE: u32 = 1 << 10;
/// Controller Not Ready
pub const USB_STS_CNR: u32 = 1 << 11;

/// Notification enable for Function Wake (N1), the only notification the driver asks for.
pub const DN_CTRL_N1: u32 = 1 << 1;

pub const CRCR_RCS_BIT: u64 = 1 << 0;

pub const OP_CONFIG_MAX_SLOTS_EN_MASK: u32 = 0x0000_00FF;
pub const OP_CONFIG_CIE_BIT: u32 = 1 << 9;

/// The operational registers of the controller, right after the capability registers. (XHCI 5.4)
#[derive(Clone, Copy)]
pub struct OperationalRegs<'a> {
    io: &'a dyn Io,
    base: usize,
}

impl<'a> OperationalRegs<'a> {
    pub fn new(io: &'a dyn Io, base: usize) -> Self {
        Self { io, base }
    }

    pub fn usb_cmd(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + OP_USBCMD)
    }
    pub fn usb_sts(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + OP_USBSTS)
    }
    pub fn page_size(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + OP_PAGESIZE)
    }
    pub fn dn_ctrl(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + OP_DNCTRL)
    }
    pub fn crcr(&self) -> Reg64<'a> {
        Reg64::new(self.io, self.base + OP_CRCR)
    }
    pub fn dcbaap(&self) -> Reg64<'a> {
        Reg64::new(self.io, self.base + OP_DCBAAP)
    }
    pub fn config(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + OP_CONFIG)
    }

    /// The register set of root hub port `index`, zero-based.
    pub fn port(&self, index: usize) -> PortRegs<'a> {
        PortRegs::new(self.io, self.base + OP_PORTS + index * OP_PORT_STRIDE)
    }

    pub fn halted(&self) -> bool {
        self.usb_sts().readf(USB_STS_HCH)
    }

    /// The page size supported by the controller, in bytes.
    pub fn page_size_bytes(&self) -> usize {
        ((self.page_size().read() & 0xFFFF) as usize) << 12
    }

    pub fn max_slots_enabled(&self) -> u8 {
        (self.config().read() & OP_CONFIG_MAX_SLOTS_EN_MASK) as u8
    }
    pub fn set_max_slots_enabled(&self, value: u8) {
        let config = self.config();
        config.write((config.read() & !OP_CONFIG_MAX_SLOTS_EN_MASK) | u32::from(value));
    }

    pub fn cie(&self) -> bool {
        self.config().readf(OP_CONFIG_CIE_BIT)
    }
    pub fn set_cie(&self, value: bool) {
        self.config().writef(OP_CONFIG_CIE_BIT, value)
    }
}
