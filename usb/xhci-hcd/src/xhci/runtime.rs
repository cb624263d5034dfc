use common::io::{Io, Reg32, Reg64};

/// Offset of the first interrupter register set inside the runtime registers.
pub const RT_IR0: usize = 0x20;
/// Size of one interrupter register set.
pub const RT_IR_STRIDE: usize = 0x20;

pub const IR_IMAN: usize = 0x00;
pub const IR_IMOD: usize = 0x04;
pub const IR_ERSTSZ: usize = 0x08;
pub const IR_ERSTBA: usize = 0x10;
pub const IR_ERDP: usize = 0x18;

/// Interrupt Pending, write one to clear.
pub const IMAN_IP: u32 = 1 << 0;
/// Interrupt Enable
pub const IMAN_IE: u32 = 1 << 1;

/// Event Handler Busy, write one to clear.
pub const ERDP_EHB: u64 = 1 << 3;

/// One interrupter register set of the runtime registers. (XHCI 5.5.2)
#[derive(Clone, Copy)]
pub struct Interrupter<'a> {
    io: &'a dyn Io,
    base: usize,
}

impl<'a> Interrupter<'a> {
    /// Interrupter `index` of the runtime registers starting at `runtime_base`.
    pub fn new(io: &'a dyn Io, runtime_base: usize, index: usize) -> Self {
        Self {
            io,
            base: runtime_base + RT_IR0 + index * RT_IR_STRIDE,
        }
    }

    pub fn iman(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + IR_IMAN)
    }
    pub fn imod(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + IR_IMOD)
    }
    pub fn erstsz(&self) -> Reg32<'a> {
        Reg32::new(self.io, self.base + IR_ERSTSZ)
    }
    pub fn erstba(&self) -> Reg64<'a> {
        Reg64::new(self.io, self.base + IR_ERSTBA)
    }
    pub fn erdp(&self) -> Reg64<'a> {
        Reg64::new(self.io, self.base + IR_ERDP)
    }

    /// Whether the interrupter has something for the driver: enabled and pending, or an event
    /// handler that has not released the ring yet.
    pub fn pending(&self) -> bool {
        self.iman().readf(IMAN_IP | IMAN_IE) || self.erdp().read() & ERDP_EHB != 0
    }
}
