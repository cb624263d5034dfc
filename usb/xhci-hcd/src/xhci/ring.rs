use std::ops::Range;
use std::sync::Arc;

use common::dma::{Dma, DmaAllocator};
use log::trace;

use super::trb::{Trb, TrbType, TRB_CONTROL_OFFSET, TRB_PARAM_OFFSET, TRB_SIZE, TRB_STATUS_OFFSET};
use crate::{Result, XhciError};

/// Rings are aligned to 64 bytes, which covers the command ring and every transfer ring.
pub const RING_ALIGN: usize = 64;

/// A producer ring of TRBs: the command ring, or the transfer ring of one endpoint.
///
/// The last slot always holds a Link TRB back to slot 0 with Toggle Cycle set. The producer cycle
/// state starts at 1, and a TRB belongs to the controller once its cycle bit equals the cycle state
/// the controller tracks for the ring.
pub struct Ring {
    trbs: Dma,
    len: usize,
    i: usize,
    cycle: bool,
}

impl Ring {
    pub fn new(dma: &Arc<dyn DmaAllocator>, len: usize) -> Result<Ring> {
        assert!(len >= 2, "a ring needs room for a link TRB");

        let trbs = Dma::zeroed(dma, len * TRB_SIZE, RING_ALIGN).ok_or(XhciError::NoMemory)?;

        let mut link = Trb::default();
        link.link(trbs.physical(), true);
        link.set_cycle(true);

        let ring = Ring {
            trbs,
            len,
            i: 0,
            cycle: true,
        };
        ring.store(len - 1, &link);

        trace!("ring of {} TRBs at {:#x}", len, ring.physical());
        Ok(ring)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Physical address of slot 0.
    pub fn physical(&self) -> u64 {
        self.trbs.physical()
    }

    /// Physical address of slot `i`.
    pub fn trb_physical(&self, i: usize) -> u64 {
        self.trbs.physical() + (i * TRB_SIZE) as u64
    }

    /// The enqueue pointer together with the producer cycle state, in the format of CRCR and of
    /// the TR Dequeue Pointer of an endpoint context.
    pub fn register(&self) -> u64 {
        self.trb_physical(self.i) | u64::from(self.cycle)
    }

    pub fn cycle(&self) -> bool {
        self.cycle
    }

    /// Index of the slot the next TRB goes to.
    pub fn index(&self) -> usize {
        self.i
    }

    /// Physical addresses of every slot, the Link TRB included.
    pub fn span(&self) -> Range<u64> {
        self.physical()..self.trb_physical(self.len)
    }

    pub fn read(&self, i: usize) -> Trb {
        let base = i * TRB_SIZE;
        Trb::new(
            self.trbs.read64(base + TRB_PARAM_OFFSET),
            self.trbs.read32(base + TRB_STATUS_OFFSET),
            self.trbs.read32(base + TRB_CONTROL_OFFSET),
        )
    }

    // The control dword goes last, since its cycle bit hands the TRB to the controller.
    fn store(&self, i: usize, trb: &Trb) {
        let base = i * TRB_SIZE;
        self.trbs.write64(base + TRB_PARAM_OFFSET, trb.param());
        self.trbs.write32(base + TRB_STATUS_OFFSET, trb.status());
        self.trbs.write32(base + TRB_CONTROL_OFFSET, trb.control());
    }

    /// Copy `trb` into the next slot with the current cycle bit and advance. Returns the physical
    /// address the TRB was written to.
    ///
    /// When the cursor reaches the Link TRB, the link is handed to the controller with the current
    /// cycle bit, the cursor goes back to slot 0 and the cycle state flips.
    pub fn push(&mut self, trb: &Trb) -> u64 {
        let mut trb = *trb;
        trb.set_cycle(self.cycle);

        let phys = self.trb_physical(self.i);
        self.store(self.i, &trb);
        self.i += 1;

        let mut next = self.read(self.i);
        if next.is_type(TrbType::Link) {
            next.set_cycle(self.cycle);
            self.trbs.write32(
                self.i * TRB_SIZE + TRB_CONTROL_OFFSET,
                next.control(),
            );
            self.i = 0;
            self.cycle = !self.cycle;
            trace!("ring {:#x} wrapped, cycle now {}", self.physical(), self.cycle);
        }

        phys
    }
}
