//! Register I/O.
//!
//! Device registers are reached through an [Io] window addressed by byte offset. Multi-byte
//! registers are always accessed at their full width, and every access is bracketed by a fence so
//! that the device observes register side effects in program order.

use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};
use core::{fmt, mem};

/// Offset-addressed register window
pub trait Io: Send + Sync {
    /// Read an 8-bit register
    fn read8(&self, offset: usize) -> u8;
    /// Read a 16-bit register
    fn read16(&self, offset: usize) -> u16;
    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;
    /// Read a 64-bit register
    fn read64(&self, offset: usize) -> u64;
    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);
    /// Write a 64-bit register
    fn write64(&self, offset: usize, value: u64);

    /// Check whether the 32-bit register at `offset` contains bit flags
    #[inline(always)]
    fn readf(&self, offset: usize, flags: u32) -> bool {
        self.read32(offset) & flags == flags
    }

    /// Enable or disable specific bit flags of the 32-bit register at `offset`
    #[inline(always)]
    fn writef(&self, offset: usize, flags: u32, value: bool) {
        let tmp = match value {
            true => self.read32(offset) | flags,
            false => self.read32(offset) & !flags,
        };
        self.write32(offset, tmp);
    }
}

/// A mapped window of device memory.
///
/// Accesses outside the window or not aligned to their own width are contract violations and
/// panic.
pub struct Mmio {
    base: NonNull<u8>,
    size: usize,
}

unsafe impl Send for Mmio {}
unsafe impl Sync for Mmio {}

impl Mmio {
    /// Wraps `size` bytes of mapped device memory starting at `base`.
    ///
    /// # Safety
    /// `base` must stay mapped, and valid for volatile reads and writes of `size` bytes, for as
    /// long as the window is alive.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    fn check<T>(&self, offset: usize) {
        let width = mem::size_of::<T>();
        assert!(
            offset % width == 0,
            "misaligned {}-byte register access at offset {:#x}",
            width,
            offset
        );
        assert!(
            offset
                .checked_add(width)
                .map_or(false, |end| end <= self.size),
            "register access at offset {:#x} outside of the {:#x} byte window",
            offset,
            self.size
        );
    }

    #[inline(always)]
    fn read<T: Copy>(&self, offset: usize) -> T {
        self.check::<T>(offset);
        fence(Ordering::SeqCst);
        let value = unsafe { ptr::read_volatile(self.base.as_ptr().add(offset) as *const T) };
        fence(Ordering::SeqCst);
        value
    }

    #[inline(always)]
    fn write<T: Copy>(&self, offset: usize, value: T) {
        self.check::<T>(offset);
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset) as *mut T, value) };
        fence(Ordering::SeqCst);
    }
}

impl Io for Mmio {
    fn read8(&self, offset: usize) -> u8 {
        self.read(offset)
    }
    fn read16(&self, offset: usize) -> u16 {
        self.read(offset)
    }
    fn read32(&self, offset: usize) -> u32 {
        self.read(offset)
    }
    fn read64(&self, offset: usize) -> u64 {
        self.read(offset)
    }
    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
    fn write64(&self, offset: usize, value: u64) {
        self.write(offset, value)
    }
}

impl fmt::Debug for Mmio {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mmio")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// A borrowed 32-bit register inside an [Io] window.
#[derive(Clone, Copy)]
pub struct Reg32<'a> {
    io: &'a dyn Io,
    offset: usize,
}

impl<'a> Reg32<'a> {
    pub fn new(io: &'a dyn Io, offset: usize) -> Self {
        Self { io, offset }
    }

    #[inline(always)]
    pub fn read(&self) -> u32 {
        self.io.read32(self.offset)
    }

    #[inline(always)]
    pub fn write(&self, value: u32) {
        self.io.write32(self.offset, value)
    }

    /// Calls [Io::readf]
    #[inline(always)]
    pub fn readf(&self, flags: u32) -> bool {
        self.io.readf(self.offset, flags)
    }

    /// Calls [Io::writef]
    #[inline(always)]
    pub fn writef(&self, flags: u32, value: bool) {
        self.io.writef(self.offset, flags, value)
    }
}

/// A borrowed 64-bit register inside an [Io] window.
#[derive(Clone, Copy)]
pub struct Reg64<'a> {
    io: &'a dyn Io,
    offset: usize,
}

impl<'a> Reg64<'a> {
    pub fn new(io: &'a dyn Io, offset: usize) -> Self {
        Self { io, offset }
    }

    #[inline(always)]
    pub fn read(&self) -> u64 {
        self.io.read64(self.offset)
    }

    #[inline(always)]
    pub fn write(&self, value: u64) {
        self.io.write64(self.offset, value)
    }
}
