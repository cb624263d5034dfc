//! Memory-backed stand-ins for register windows and DMA, for the unit tests of this module.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use common::dma::DmaAllocator;
use common::io::{Io, Mmio};
use spin::Mutex;

/// A plain block of memory behind an [Mmio] window, standing in for device registers.
pub struct ScratchWindow {
    _backing: Box<[u64]>,
    mmio: Mmio,
}

impl ScratchWindow {
    pub fn new(len: usize) -> Self {
        let mut backing = vec![0u64; (len + 7) / 8].into_boxed_slice();
        let size = backing.len() * mem::size_of::<u64>();
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let mmio = unsafe { Mmio::new(base, size) };
        Self {
            _backing: backing,
            mmio,
        }
    }

    pub fn io(&self) -> &dyn Io {
        &self.mmio
    }
}

/// Physical addresses handed out by [HeapDma] are the virtual ones shifted by this amount, so that
/// mixing the two up shows.
pub const PHYS_OFFSET: u64 = 0x1000_0000_0000_0000;

/// A [DmaAllocator] over the global allocator.
#[derive(Default)]
pub struct HeapDma {
    live: Mutex<Vec<(usize, usize)>>,
}

impl HeapDma {
    pub fn new() -> Arc<dyn DmaAllocator> {
        Arc::new(Self::default())
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }
}

impl DmaAllocator for HeapDma {
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<(NonNull<u8>, u64)> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        self.live.lock().push((virt.as_ptr() as usize, size));
        Some((virt, virt.as_ptr() as u64 + PHYS_OFFSET))
    }

    unsafe fn free(&self, virt: NonNull<u8>, size: usize, align: usize) {
        self.live
            .lock()
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
            .iter()
            .find(|&&(base, size)| virt >= base && virt < base + size)
            .and_then(|_| NonNull::new(virt as *mut u8))
    }
}
