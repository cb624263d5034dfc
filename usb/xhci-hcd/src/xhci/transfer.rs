//! Control transfers on the default control endpoint.
//!
//! A control transfer is a Setup Stage TRB, an optional data stage and a Status Stage TRB. The
//! data stage and the status stage each end in an Event Data TRB pointing at a small status
//! buffer; when the controller reaches it, the interrupt handler copies the completion status
//! into the buffer and sets [STATUS_DONE_BIT], which is what [Xhci::wait_for_interrupt] polls.
use common::dma::Dma;
use log::{error, trace};

use super::ring::Ring;
use super::trb::{
    completion_code_of, CompletionState, TransferKind, Trb, TrbCompletionCode, STATUS_DONE_BIT,
    TRB_TD_SIZE_MAX,
};
use super::{PortState, Xhci};
use crate::usb::Setup;
use crate::{Result, XhciError};

/// Device context index of the default control endpoint.
pub const CONTROL_DCI: u8 = 1;

/// The controller writes 4 bytes of status but wants the buffer 16-byte aligned.
pub const STATUS_BUFFER_SIZE: usize = 16;

const DATA_BUFFER_ALIGN: usize = 64;

/// Queue the Setup Stage TRB of a transfer. Returns the number of TRBs written.
pub fn setup_stage(ring: &mut Ring, setup: Setup, kind: TransferKind) -> usize {
    let mut trb = Trb::default();
    trb.setup(setup, kind, 0);
    ring.push(&trb);
    1
}

/// Queue the data stage of `size` bytes at `buffer`, split into packets of `max_packet` bytes,
/// followed by an Event Data TRB that reports to `status`.
///
/// The first TRB is a Data Stage TRB carrying the direction, the rest are Normal TRBs. Every TRB
/// chains to the next, and its TD Size is the number of packets left after it. Returns the number
/// of TRBs written, the Event Data TRB included; nothing is written for an empty stage.
pub fn data_stage(
    ring: &mut Ring,
    buffer: u64,
    size: usize,
    input: bool,
    max_packet: u16,
    status: u64,
) -> usize {
    if size == 0 {
        return 0;
    }

    let max_packet = usize::from(max_packet.max(1));
    let mut remaining_packets = (size + max_packet - 1) / max_packet;
    let mut offset = 0;
    let mut count = 0;

    while offset < size {
        remaining_packets -= 1;
        let length = (size - offset).min(max_packet) as u32;
        let td_size = (remaining_packets as u32).min(TRB_TD_SIZE_MAX);
        let last = remaining_packets == 0;

        let mut trb = Trb::default();
        if count == 0 {
            trb.data(buffer + offset as u64, length, td_size, 0, input, true, last);
        } else {
            trb.normal(
                buffer + offset as u64,
                length,
                td_size as u8,
                0,
                last,
                false,
                true,
                false,
                false,
                false,
            );
        }
        ring.push(&trb);

        offset += max_packet;
        count += 1;
    }

    let mut event_data = Trb::default();
    event_data.event_data_trb(status, 0, false, true);
    ring.push(&event_data);

    count + 1
}

/// Queue the Status Stage TRB and its Event Data TRB. `input` is the direction of the status
/// stage, opposite to the data stage. Returns the number of TRBs written.
pub fn status_stage(ring: &mut Ring, input: bool, status: u64) -> usize {
    let mut trb = Trb::default();
    trb.status_stage(0, input, true, false, false);
    ring.push(&trb);

    let mut event_data = Trb::default();
    event_data.event_data_trb(status, 0, false, true);
    ring.push(&event_data);

    2
}

fn check_completion(status: u32) -> Result<()> {
    let code = completion_code_of(status);
    if code == TrbCompletionCode::Success as u8 || code == TrbCompletionCode::ShortPacket as u8 {
        Ok(())
    } else if code == TrbCompletionCode::Stall as u8
        || code == TrbCompletionCode::DataBuffer as u8
        || code == TrbCompletionCode::BabbleDetected as u8
    {
        Err(XhciError::Invalid("transfer"))
    } else {
        error!(
            "xhci wait interrupt: status={:#010x}, complete_code={}",
            status, code
        );
        Err(XhciError::Io)
    }
}

impl Xhci {
    /// Poll `status` until the interrupt handler reports the transfer done, then map its
    /// completion code.
    pub fn wait_for_interrupt(&self, status: &Dma) -> Result<()> {
        let mut timeout = self.config.timeouts.transfer();
        loop {
            if let CompletionState::Done { status } = CompletionState::from_status(status.read32(0))
            {
                return check_completion(status);
            }
            timeout.run(|d| self.delay(d)).map_err(|()| {
                error!("xHCI {}: interrupt wait timed out", self.id);
                XhciError::Timeout("transfer completion")
            })?;
        }
    }

    fn transfer_buffers(&self, len: usize) -> Result<(Dma, Dma)> {
        let status = Dma::zeroed(&self.dma, STATUS_BUFFER_SIZE, STATUS_BUFFER_SIZE)
            .ok_or(XhciError::NoMemory)?;
        let data =
            Dma::zeroed(&self.dma, len.max(1), DATA_BUFFER_ALIGN).ok_or(XhciError::NoMemory)?;
        Ok((status, data))
    }

    /// Run a device-to-host control transfer on the default control endpoint of `state`, reading
    /// `buf.len()` bytes. Returns the number of bytes copied into `buf`.
    pub fn control_in(&self, state: &mut PortState, setup: Setup, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        let slot = state.slot;
        let max_packet = state.control_max_packet;
        let (status, data) = self.transfer_buffers(len)?;

        let ring = state
            .rings
            .get_mut(&CONTROL_DCI)
            .ok_or(XhciError::Invalid("control endpoint"))?;

        let kind = if len == 0 {
            TransferKind::NoData
        } else {
            TransferKind::In
        };
        setup_stage(ring, setup, kind);
        let data_trbs = data_stage(
            ring,
            data.physical(),
            len,
            true,
            max_packet,
            status.physical(),
        );
        trace!(
            "xHCI {}: slot {} control in of {} bytes, {} data TRBs",
            self.id,
            slot,
            len,
            data_trbs
        );

        // Emulated controllers only complete the data stage once the status stage is queued.
        if data_trbs > 0 && !self.config.quirks.emulator {
            self.doorbells().ring(slot, u32::from(CONTROL_DCI));
            self.wait_for_interrupt(&status)?;
        }

        status.zero();
        status_stage(ring, false, status.physical());
        self.doorbells().ring(slot, u32::from(CONTROL_DCI));
        self.wait_for_interrupt(&status)?;

        data.read_bytes(0, buf);
        Ok(len)
    }

    /// Run a host-to-device control transfer on the default control endpoint of `state`, sending
    /// `buf`. Returns the number of bytes sent.
    pub fn control_out(&self, state: &mut PortState, setup: Setup, buf: &[u8]) -> Result<usize> {
        let len = buf.len();
        let slot = state.slot;
        let max_packet = state.control_max_packet;
        let (status, data) = self.transfer_buffers(len)?;
        data.write_bytes(0, buf);

        let ring = state
            .rings
            .get_mut(&CONTROL_DCI)
            .ok_or(XhciError::Invalid("control endpoint"))?;

        let kind = if len == 0 {
            TransferKind::NoData
        } else {
            TransferKind::Out
        };
        setup_stage(ring, setup, kind);
        let data_trbs = data_stage(
            ring,
            data.physical(),
            len,
            false,
            max_packet,
            status.physical(),
        );
        trace!(
            "xHCI {}: slot {} control out of {} bytes, {} data TRBs",
            self.id,
            slot,
            len,
            data_trbs
        );

        if data_trbs > 0 && !self.config.quirks.emulator {
            self.doorbells().ring(slot, u32::from(CONTROL_DCI));
            self.wait_for_interrupt(&status)?;
        }

        status.zero();
        status_stage(ring, true, status.physical());
        self.doorbells().ring(slot, u32::from(CONTROL_DCI));
        if !self.config.quirks.emulator {
            self.wait_for_interrupt(&status)?;
        } else if status.read32(0) & STATUS_DONE_BIT != 0 {
            check_completion(status.read32(0) & !STATUS_DONE_BIT)?;
        }

        Ok(len)
    }
}
