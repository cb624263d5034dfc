use log::{error, trace};

use super::trb::{CompletionState, Trb, TrbCompletionCode};
use super::Xhci;
use crate::{Result, XhciError};

impl Xhci {
    /// Post `trb` on the command ring.
    ///
    /// With `wait`, ring the command doorbell and poll the TRB until the interrupt handler marks
    /// it done. The command ring stays locked until then, so commands never overlap. Returns the
    /// TRB as completed by the interrupt handler (completion status, and the slot id for Enable
    /// Slot), with the done bit cleared. Without `wait`, returns the TRB as posted.
    pub fn send_command(&self, trb: Trb, wait: bool) -> Result<Trb> {
        let mut cmd = self.cmd.lock();

        let index = cmd.index();
        let phys = cmd.push(&trb);
        trace!("xHCI {}: command {} at {:#x}", self.id, trb, phys);

        if !wait {
            return Ok(cmd.read(index));
        }

        self.doorbells().ring(0, 0);

        let mut timeout = self.config.timeouts.command();
        loop {
            let mut done = cmd.read(index);
            if let CompletionState::Done { status } = CompletionState::from_status(done.status()) {
                done.set_status(status);
                return Ok(done);
            }
            timeout.run(|d| self.delay(d)).map_err(|()| {
                error!(
                    "xHCI {}: command {:#x} timed out, type {}",
                    self.id,
                    phys,
                    trb.trb_type()
                );
                XhciError::Timeout("command completion")
            })?;
        }
    }

    /// Issue Enable Slot and return the slot id the controller assigned.
    pub fn enable_slot(&self, slot_type: u8) -> Result<u8> {
        let mut trb = Trb::default();
        trb.enable_slot(slot_type);

        let done = self.send_command(trb, true)?;
        if done.completion_code() != TrbCompletionCode::Success as u8 {
            error!(
                "xHCI {}: enable slot failed with completion code {}",
                self.id,
                done.completion_code()
            );
            return Err(XhciError::Again);
        }

        match done.event_slot() {
            0 => {
                error!("xHCI {}: enable slot returned slot 0", self.id);
                Err(XhciError::Again)
            }
            slot => Ok(slot),
        }
    }
}
