use common::io::Io;

/// The doorbell array, one 32-bit register per device slot. Doorbell 0 belongs to the command
/// ring. (XHCI 5.6)
#[derive(Clone, Copy)]
pub struct Doorbells<'a> {
    io: &'a dyn Io,
    base: usize,
}

impl<'a> Doorbells<'a> {
    pub fn new(io: &'a dyn Io, base: usize) -> Self {
        Self { io, base }
    }

    pub fn read(&self, slot: u8) -> u32 {
        self.io.read32(self.base + usize::from(slot) * 4)
    }

    /// Ring doorbell `slot`. For a device slot, `target` is the DCI of the endpoint with new work.
    pub fn ring(&self, slot: u8, target: u32) {
        self.io.write32(self.base + usize::from(slot) * 4, target);
    }
}
