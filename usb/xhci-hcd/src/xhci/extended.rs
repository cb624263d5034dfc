use std::ops::Range;

use common::io::Io;
use common::timeout::Timeout;
use log::{debug, error};

use crate::{Result, XhciError};

/// Walks the extended capability list of a controller, yielding `(offset, capability id)`.
///
/// Offsets are relative to the start of the capability registers. (XHCI 7.0)
pub struct ExtendedCapabilitiesIter<'a> {
    io: &'a dyn Io,
    offset: Option<usize>,
}

impl<'a> ExtendedCapabilitiesIter<'a> {
    pub fn new(io: &'a dyn Io, first: Option<usize>) -> Self {
        Self { io, offset: first }
    }
}

impl<'a> Iterator for ExtendedCapabilitiesIter<'a> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.offset?;

        let reg = self.io.read32(current);
        let capability_id = (reg & 0xFF) as u8;
        let next_rel_in_dwords = ((reg & 0xFF00) >> 8) as u8;
        let next_rel = usize::from(next_rel_in_dwords) << 2;

        self.offset = if next_rel != 0 {
            Some(current + next_rel)
        } else {
            None
        };

        Some((current, capability_id))
    }
}

#[repr(u8)]
pub enum CapabilityId {
    // bit 0 is reserved
    UsbLegacySupport = 1,
    SupportedProtocol,
    ExtendedPowerManagement,
    IoVirtualization,
    MessageInterrupt,
    LocalMem,
    // bits 7-9 are reserved
    UsbDebugCapability = 10,
    // bits 11-16 are reserved
    ExtendedMessageInterrupt = 17,
    // bits 18-191 are reserved
    // bits 192-255 are vendor-defined
}

/// Set by the firmware while it owns the controller. (XHCI 7.1.1)
pub const LEGACY_BIOS_OWNED: u32 = 1 << 16;
/// Set by the operating system to request ownership.
pub const LEGACY_OS_OWNED: u32 = 1 << 24;
pub const LEGACY_OWNED_MASK: u32 = LEGACY_BIOS_OWNED | LEGACY_OS_OWNED;

/// Take the controller away from the firmware, if the firmware has a USB Legacy Support
/// capability at all.
pub fn stop_legacy(
    io: &dyn Io,
    first: Option<usize>,
    mut timeout: Timeout,
    delay: impl Fn(std::time::Duration),
) -> Result<()> {
    let offset = match ExtendedCapabilitiesIter::new(io, first)
        .find(|&(_, id)| id == CapabilityId::UsbLegacySupport as u8)
    {
        Some((offset, _)) => offset,
        None => {
            debug!("no USB legacy support capability");
            return Ok(());
        }
    };

    io.write32(offset, io.read32(offset) | LEGACY_OS_OWNED);

    while io.read32(offset) & LEGACY_OWNED_MASK != LEGACY_OS_OWNED {
        if timeout.run(&delay).is_err() {
            error!("The BIOS doesn't stop legacy support.");
            return Err(XhciError::Timeout("legacy handoff"));
        }
    }

    Ok(())
}

pub const SUPP_PROTO_CAP_REV_MIN_MASK: u32 = 0x00FF_0000;
pub const SUPP_PROTO_CAP_REV_MIN_SHIFT: u8 = 16;

pub const SUPP_PROTO_CAP_REV_MAJ_MASK: u32 = 0xFF00_0000;
pub const SUPP_PROTO_CAP_REV_MAJ_SHIFT: u8 = 24;

pub const SUPP_PROTO_CAP_COMPAT_PORT_OFF_MASK: u32 = 0x0000_00FF;
pub const SUPP_PROTO_CAP_COMPAT_PORT_OFF_SHIFT: u8 = 0;

pub const SUPP_PROTO_CAP_COMPAT_PORT_CNT_MASK: u32 = 0x0000_FF00;
pub const SUPP_PROTO_CAP_COMPAT_PORT_CNT_SHIFT: u8 = 8;

pub const SUPP_PROTO_CAP_PROTO_DEF_MASK: u32 = 0x0FFF_0000;
pub const SUPP_PROTO_CAP_PROTO_DEF_SHIFT: u8 = 16;

/// High-speed Only, in the protocol defined field of a USB 2 protocol capability.
pub const SUPP_PROTO_USB2_HSO_BIT: u16 = 1 << 1;

pub const USB2_MAJOR: u8 = 2;
pub const USB3_MAJOR: u8 = 3;

/// A decoded xHCI Supported Protocol Capability. (XHCI 7.2)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SupportedProtocol {
    pub major: u8,
    pub minor: u8,
    /// First root hub port of the protocol, one-based.
    pub port_offset: u8,
    pub port_count: u8,
    pub proto_defined: u16,
}

impl SupportedProtocol {
    pub fn read(io: &dyn Io, offset: usize) -> Self {
        let a = io.read32(offset);
        let c = io.read32(offset + 8);

        Self {
            major: ((a & SUPP_PROTO_CAP_REV_MAJ_MASK) >> SUPP_PROTO_CAP_REV_MAJ_SHIFT) as u8,
            minor: ((a & SUPP_PROTO_CAP_REV_MIN_MASK) >> SUPP_PROTO_CAP_REV_MIN_SHIFT) as u8,
            port_offset: ((c & SUPP_PROTO_CAP_COMPAT_PORT_OFF_MASK)
                >> SUPP_PROTO_CAP_COMPAT_PORT_OFF_SHIFT) as u8,
            port_count: ((c & SUPP_PROTO_CAP_COMPAT_PORT_CNT_MASK)
                >> SUPP_PROTO_CAP_COMPAT_PORT_CNT_SHIFT) as u8,
            proto_defined: ((c & SUPP_PROTO_CAP_PROTO_DEF_MASK) >> SUPP_PROTO_CAP_PROTO_DEF_SHIFT)
                as u16,
        }
    }

    /// Zero-based indices of the root hub ports this protocol covers.
    pub fn port_range(&self) -> Range<usize> {
        let first = usize::from(self.port_offset.saturating_sub(1));
        first..first + usize::from(self.port_count)
    }

    pub fn high_speed_only(&self) -> bool {
        self.major == USB2_MAJOR && self.proto_defined & SUPP_PROTO_USB2_HSO_BIT != 0
    }
}

/// Every Supported Protocol Capability of the controller, in list order.
pub fn supported_protocols(io: &dyn Io, first: Option<usize>) -> Vec<SupportedProtocol> {
    ExtendedCapabilitiesIter::new(io, first)
        .filter(|&(_, id)| id == CapabilityId::SupportedProtocol as u8)
        .map(|(offset, _)| SupportedProtocol::read(io, offset))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::xhci::test_util::ScratchWindow;

    #[test]
    fn walks_protocols_and_skips_others() {
        let window = ScratchWindow::new(0x100);
        let io = window.io();

        // 0x40: legacy support, next in 4 dwords
        io.write32(0x40, (4 << 8) | 1);
        // 0x50: USB 3.0 ports 1-4, next in 4 dwords
        io.write32(0x50, (3 << 24) | (4 << 8) | 2);
        io.write32(0x58, (4 << 8) | 1);
        // 0x60: USB 2.0 ports 5-8, high-speed only, end of list
        io.write32(0x60, (2 << 24) | 2);
        io.write32(0x68, (0b10 << 16) | (4 << 8) | 5);

        let ids: Vec<u8> = ExtendedCapabilitiesIter::new(io, Some(0x40))
            .map(|(_, id)| id)
            .collect();
        assert_eq!(ids, vec![1, 2, 2]);

        let protocols = supported_protocols(io, Some(0x40));
        assert_eq!(protocols.len(), 2);
        assert_eq!(protocols[0].major, 3);
        assert_eq!(protocols[0].port_range(), 0..4);
        assert!(!protocols[0].high_speed_only());
        assert_eq!(protocols[1].port_range(), 4..8);
        assert!(protocols[1].high_speed_only());

        assert_eq!(supported_protocols(io, None), vec![]);
    }

    #[test]
    fn legacy_handoff() {
        let window = ScratchWindow::new(0x100);
        let io = window.io();
        io.write32(0x40, 1);

        // Nothing clears the BIOS bit here, so the handoff succeeds as soon as the OS bit sticks.
        stop_legacy(io, Some(0x40), Timeout::from_millis(3), |_| ()).unwrap();
        assert_eq!(io.read32(0x40) & LEGACY_OS_OWNED, LEGACY_OS_OWNED);

        io.write32(0x40, 1 | LEGACY_BIOS_OWNED);
        assert_eq!(
            stop_legacy(io, Some(0x40), Timeout::from_millis(3), |_| ()),
            Err(XhciError::Timeout("legacy handoff"))
        );
    }

    #[test]
    fn no_legacy_capability_is_fine() {
        let window = ScratchWindow::new(0x100);
        stop_legacy(window.io(), None, Timeout::from_millis(1), |_| ()).unwrap();
    }
}
