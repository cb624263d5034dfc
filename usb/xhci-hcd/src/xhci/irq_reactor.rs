//! The interrupt side of the driver.
//!
//! Waiters never look at the event ring. Instead, the handler drains the primary event ring and
//! reports every completion back into memory the waiter is polling: a command completion is
//! written into the status word of the command TRB on the command ring, and a transfer event
//! raised by an Event Data TRB is written into the status buffer the Event Data TRB points at. In
//! both cases the written status carries the done bit (see [CompletionState]).
use std::ops::Range;

use common::dma::{self, DmaAllocator};
use log::{debug, trace, warn};

use super::runtime::{ERDP_EHB, IMAN_IE, IMAN_IP};
use super::trb::{
    CompletionState, Trb, TrbCompletionCode, TrbType, TRB_CONTROL_OFFSET,
    TRB_CONTROL_SLOT_ID_MASK, TRB_SIZE, TRB_STATUS_OFFSET,
};
use super::Xhci;

/// Report a Command Completion Event into the command TRB it points at. For Enable Slot, the
/// assigned slot id is copied into the command TRB as well.
///
/// `commands` is the physical span of the command ring. Returns `false`, and writes nothing, if
/// the event does not point at a TRB slot inside it.
pub fn complete_command(dma: &dyn DmaAllocator, commands: &Range<u64>, event: &Trb) -> bool {
    let phys = event.param();
    if !commands.contains(&phys) || (phys - commands.start) % TRB_SIZE as u64 != 0 {
        return false;
    }
    let origin = match dma.phys_to_virt(phys) {
        Some(origin) => origin.as_ptr(),
        None => return false,
    };

    unsafe {
        let control_ptr = origin.add(TRB_CONTROL_OFFSET);
        let control = dma::read32(control_ptr);
        let origin_type = Trb::new(0, 0, control).trb_type();

        // The slot id goes in before the done bit, so the waiter always sees both.
        if origin_type == TrbType::EnableSlot as u8 {
            dma::write32(
                control_ptr,
                (control & !TRB_CONTROL_SLOT_ID_MASK) | (event.control() & TRB_CONTROL_SLOT_ID_MASK),
            );
        }

        dma::write32(
            origin.add(TRB_STATUS_OFFSET),
            CompletionState::done(event.status()),
        );
    }
    true
}

/// Report a Transfer Event with the Event Data bit set into the status buffer it points at.
///
/// Returns `false` if the status buffer is not in memory the allocator knows about, typically
/// because its waiter gave up and released it.
pub fn complete_transfer(dma: &dyn DmaAllocator, event: &Trb) -> bool {
    match dma.phys_to_virt(event.param()) {
        Some(status) => {
            unsafe { dma::write32(status.as_ptr(), CompletionState::done(event.status())) };
            true
        }
        None => false,
    }
}

impl Xhci {
    /// Service an interrupt of the controller: acknowledge it, then consume every event the
    /// controller produced on the primary event ring.
    pub fn irq_handler(&self) {
        let op = self.op();
        let usb_sts = op.usb_sts().read();
        op.usb_sts().write(usb_sts);

        let int = self.interrupter(0);
        if !int.pending() {
            trace!("xHCI {}: spurious interrupt, USBSTS {:#x}", self.id, usb_sts);
            return;
        }
        let iman = int.iman().read();
        int.iman().write(iman | IMAN_IP | IMAN_IE);

        let mut ring = self.primary_event_ring.lock();
        let mut count = 0;
        while let Some(event) = ring.next() {
            self.handle_event(&event);
            count += 1;
        }
        int.erdp().write(ring.erdp() | ERDP_EHB);

        trace!("xHCI {}: handled {} events", self.id, count);
    }

    fn handle_event(&self, event: &Trb) {
        if event.is_type(TrbType::CommandCompletion) {
            if event.event_data_bit() {
                return;
            }
            if !complete_command(&*self.dma, &self.cmd_span, event) {
                warn!(
                    "xHCI {}: command completion for unknown TRB {:#x}",
                    self.id,
                    event.param()
                );
            }
        } else if event.is_type(TrbType::Transfer) {
            if event.event_data_bit() {
                if !complete_transfer(&*self.dma, event) {
                    debug!(
                        "xHCI {}: transfer event for released status buffer {:#x}",
                        self.id,
                        event.param()
                    );
                }
            } else if event.completion_code() != TrbCompletionCode::Success as u8 {
                warn!(
                    "xHCI {}: transfer event {} on slot {} endpoint {}, completion code {}",
                    self.id,
                    event,
                    event.event_slot(),
                    event.endpoint_id(),
                    event.completion_code()
                );
            }
        } else if event.is_type(TrbType::PortStatusChange) {
            match event.port_status_change_port_id() {
                Some(port) => debug!("xHCI {}: port {} status change", self.id, port),
                None => debug!("xHCI {}: port status change {}", self.id, event),
            }
        } else {
            trace!("xHCI {}: ignoring event {}", self.id, event);
        }
    }
}
