use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::{fmt, mem};

/// Supplier of physically contiguous memory that a device can reach by bus address.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` zeroed bytes aligned to `align`, returning the virtual and physical
    /// address of the allocation.
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<(NonNull<u8>, u64)>;

    /// Release an allocation made by [DmaAllocator::alloc_zeroed].
    ///
    /// # Safety
    /// `virt`, `size` and `align` must describe a live allocation of this allocator, which must
    /// not be accessed afterwards.
    unsafe fn free(&self, virt: NonNull<u8>, size: usize, align: usize);

    /// Translate a physical address inside a live allocation back to its virtual address.
    fn phys_to_virt(&self, phys: u64) -> Option<NonNull<u8>>;
}

/// An RAII guard of a DMA allocation. The memory is returned to its allocator on drop.
///
/// All accessors are volatile, since the device may read or write the memory at any time.
pub struct Dma {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
    align: usize,
    allocator: Arc<dyn DmaAllocator>,
}

unsafe impl Send for Dma {}
unsafe impl Sync for Dma {}

impl Dma {
    /// Allocate `size` zeroed bytes aligned to `align`. Returns `None` when out of memory.
    pub fn zeroed(allocator: &Arc<dyn DmaAllocator>, size: usize, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two());
        let (virt, phys) = allocator.alloc_zeroed(size, align)?;
        debug_assert_eq!(phys % align as u64, 0);

        Some(Self {
            virt,
            phys,
            size,
            align,
            allocator: Arc::clone(allocator),
        })
    }

    /// Retrieve the byte address in physical memory of this allocation.
    pub fn physical(&self) -> u64 {
        self.phys
    }

    /// Retrieve the size in bytes of the allocation.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    #[inline(always)]
    fn check<T>(&self, offset: usize) {
        let width = mem::size_of::<T>();
        assert!(
            offset % width == 0 && offset + width <= self.size,
            "DMA access of {} bytes at offset {:#x} in a {:#x} byte buffer",
            width,
            offset,
            self.size
        );
    }

    pub fn read32(&self, offset: usize) -> u32 {
        self.check::<u32>(offset);
        unsafe { read32(self.virt.as_ptr().add(offset)) }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        self.check::<u32>(offset);
        unsafe { write32(self.virt.as_ptr().add(offset), value) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        self.check::<u64>(offset);
        unsafe { read64(self.virt.as_ptr().add(offset)) }
    }

    pub fn write64(&self, offset: usize, value: u64) {
        self.check::<u64>(offset);
        unsafe { write64(self.virt.as_ptr().add(offset), value) }
    }

    /// Copy `buf.len()` bytes out of the allocation, starting at `offset`.
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.size);
        fence(Ordering::SeqCst);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { ptr::read_volatile(self.virt.as_ptr().add(offset + i)) };
        }
    }

    /// Copy `buf` into the allocation, starting at `offset`.
    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= self.size);
        for (i, byte) in buf.iter().enumerate() {
            unsafe { ptr::write_volatile(self.virt.as_ptr().add(offset + i), *byte) };
        }
        fence(Ordering::SeqCst);
    }

    /// Zero the whole allocation.
    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.virt.as_ptr(), 0, self.size) };
        fence(Ordering::SeqCst);
    }
}

impl Drop for Dma {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.virt, self.size, self.align) }
    }
}

impl fmt::Debug for Dma {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dma")
            .field("virt", &self.virt)
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.size)
            .finish()
    }
}

/// Volatile, fenced 32-bit load from DMA memory.
///
/// # Safety
/// `ptr` must be 4-byte aligned and valid for reads.
#[inline(always)]
pub unsafe fn read32(ptr: *const u8) -> u32 {
    fence(Ordering::SeqCst);
    let value = ptr::read_volatile(ptr as *const u32);
    fence(Ordering::SeqCst);
    value
}

/// Volatile, fenced 32-bit store to DMA memory.
///
/// # Safety
/// `ptr` must be 4-byte aligned and valid for writes.
#[inline(always)]
pub unsafe fn write32(ptr: *mut u8, value: u32) {
    fence(Ordering::SeqCst);
    ptr::write_volatile(ptr as *mut u32, value);
    fence(Ordering::SeqCst);
}

/// Volatile, fenced 64-bit load from DMA memory.
///
/// # Safety
/// `ptr` must be 8-byte aligned and valid for reads.
#[inline(always)]
pub unsafe fn read64(ptr: *const u8) -> u64 {
    fence(Ordering::SeqCst);
    let value = ptr::read_volatile(ptr as *const u64);
    fence(Ordering::SeqCst);
    value
}

/// Volatile, fenced 64-bit store to DMA memory.
///
/// # Safety
/// `ptr` must be 8-byte aligned and valid for writes.
#[inline(always)]
pub unsafe fn write64(ptr: *mut u8, value: u64) {
    fence(Ordering::SeqCst);
    ptr::write_volatile(ptr as *mut u64, value);
    fence(Ordering::SeqCst);
}
