use std::sync::Arc;

use common::dma::{Dma, DmaAllocator};

use super::trb::{Trb, TRB_CONTROL_OFFSET, TRB_PARAM_OFFSET, TRB_SIZE, TRB_STATUS_OFFSET};
use crate::{Result, XhciError};

/// The segment table has room for four entries, though only one segment is used.
pub const ERST_SIZE: usize = 64;

/// The consumer side of a single-segment event ring, with its segment table.
///
/// The segment spans the whole ring. When the dequeue cursor runs off the end of the segment it
/// returns to slot 0 and the consumer cycle state flips, mirroring what the controller does as the
/// producer.
// TODO: Grow to more segments when ERST Max allows, instead of one large segment.
pub struct EventRing {
    ste: Dma,
    trbs: Dma,
    len: usize,
    i: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new(dma: &Arc<dyn DmaAllocator>, len: usize) -> Result<EventRing> {
        let ste = Dma::zeroed(dma, ERST_SIZE, 64).ok_or(XhciError::NoMemory)?;
        let trbs = Dma::zeroed(dma, len * TRB_SIZE, 64).ok_or(XhciError::NoMemory)?;

        ste.write64(0, trbs.physical());
        ste.write32(8, len as u32);

        Ok(EventRing {
            ste,
            trbs,
            len,
            i: 0,
            cycle: true,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn cycle(&self) -> bool {
        self.cycle
    }

    pub fn index(&self) -> usize {
        self.i
    }

    /// Physical address of the segment table, for ERSTBA.
    pub fn erstba(&self) -> u64 {
        self.ste.physical()
    }

    /// Physical address of the next event to consume, for ERDP.
    pub fn erdp(&self) -> u64 {
        self.trbs.physical() + (self.i * TRB_SIZE) as u64
    }

    pub fn segment_physical(&self) -> u64 {
        self.trbs.physical()
    }

    fn read(&self, i: usize) -> Trb {
        let base = i * TRB_SIZE;
        // Control first: the rest of the TRB is only valid once the cycle bit says so.
        let control = self.trbs.read32(base + TRB_CONTROL_OFFSET);
        let status = self.trbs.read32(base + TRB_STATUS_OFFSET);
        let param = self.trbs.read64(base + TRB_PARAM_OFFSET);
        Trb::new(param, status, control)
    }

    /// The event at the dequeue cursor, if the controller has produced it.
    pub fn peek(&self) -> Option<Trb> {
        let trb = self.read(self.i);
        if trb.cycle() == self.cycle {
            Some(trb)
        } else {
            None
        }
    }

    pub fn advance(&mut self) {
        self.i += 1;
        if self.i == self.len {
            self.i = 0;
            self.cycle = !self.cycle;
        }
    }

    /// Take the event at the cursor and advance past it.
    pub fn next(&mut self) -> Option<Trb> {
        let trb = self.peek()?;
        self.advance();
        Some(trb)
    }
}
