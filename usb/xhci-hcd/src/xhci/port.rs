use std::fmt;

use common::io::Io;
use log::{info, warn};

use super::extended::{SupportedProtocol, USB2_MAJOR, USB3_MAJOR};

// RO - read-only
// ROS - read-only sticky
// RW - read/write
// RWS - read/write sticky
// RW1CS - read/write-1-to-clear sticky
// RW1S - read/write-1-to-set
// Sticky register values may preserve values through chip hardware reset

bitflags! {
    pub struct PortFlags: u32 {
        const CCS = 1 << 0; // ROS
        const PED = 1 << 1; // RW1CS
        const RSVD_2 = 1 << 2; // RsvdZ
        const OCA = 1 << 3; // RO
        const PR =  1 << 4; // RW1S
        const PLS_0 = 1 << 5; // RWS
        const PLS_1 = 1 << 6; // RWS
        const PLS_2 = 1 << 7; // RWS
        const PLS_3 = 1 << 8; // RWS
        const PP =  1 << 9; // RWS
        const SPEED_0 =  1 << 10; // ROS
        const SPEED_1 =  1 << 11; // ROS
        const SPEED_2 =  1 << 12; // ROS
        const SPEED_3 =  1 << 13; // ROS
        const PIC_AMB = 1 << 14; // RWS
        const PIC_GRN = 1 << 15; // RWS
        const LWS = 1 << 16; // RW
        const CSC = 1 << 17; // RW1CS
        const PEC = 1 << 18; // RW1CS
        const WRC = 1 << 19; // RW1CS
        const OCC = 1 << 20; // RW1CS
        const PRC = 1 << 21; // RW1CS
        const PLC = 1 << 22; // RW1CS
        const CEC = 1 << 23; // RW1CS
        const CAS = 1 << 24; // RO
        const WCE = 1 << 25; // RWS
        const WDE = 1 << 26; // RWS
        const WOE = 1 << 27; // RWS
        const RSVD_28 = 1 << 28; // RsvdZ
        const RSVD_29 = 1 << 29; // RsvdZ
        const DR =  1 << 30; // RO
        const WPR = 1 << 31; // RW1S

        /// The change bits written back as ones to acknowledge them.
        const CHANGE_BITS = Self::CSC.bits
            | Self::PEC.bits
            | Self::OCC.bits
            | Self::PRC.bits
            | Self::PLC.bits;
    }
}

pub const PORT_PORTSC: usize = 0x00;

pub const PORTSC_PLS_MASK: u32 = 0b1111 << 5;
pub const PORTSC_PLS_SHIFT: u8 = 5;
pub const PORTSC_SPEED_MASK: u32 = 0b1111 << 10;
pub const PORTSC_SPEED_SHIFT: u8 = 10;

/// The register set of one root hub port. (XHCI 5.4.8)
#[derive(Clone, Copy)]
pub struct PortRegs<'a> {
    io: &'a dyn Io,
    base: usize,
}

impl<'a> PortRegs<'a> {
    pub fn new(io: &'a dyn Io, base: usize) -> Self {
        Self { io, base }
    }

    // PORTSC has write one to clear fields, so writes always go through `write` with an explicit
    // value.
    pub fn read(&self) -> u32 {
        self.io.read32(self.base + PORT_PORTSC)
    }

    pub fn write(&self, flags: PortFlags) {
        self.io.write32(self.base + PORT_PORTSC, flags.bits());
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(self.read())
    }

    pub fn state(&self) -> u8 {
        ((self.read() & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT) as u8
    }

    pub fn speed(&self) -> u8 {
        ((self.read() & PORTSC_SPEED_MASK) >> PORTSC_SPEED_SHIFT) as u8
    }
}

/// Protocol speed IDs of the default speed mapping. (XHCI Table 7-13)
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortSpeed {
    Full = 1,
    Low = 2,
    High = 3,
    Super = 4,
}

impl PortSpeed {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Full),
            2 => Some(Self::Low),
            3 => Some(Self::High),
            4 => Some(Self::Super),
            _ => None,
        }
    }

    /// The max packet size of the default control endpoint before the device descriptor is known.
    pub fn default_max_packet_size(&self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Full | Self::High => 64,
            Self::Super => 512,
        }
    }
}

bitflags! {
    /// What the driver knows about a root hub port from the supported protocol capabilities.
    #[derive(Default)]
    pub struct ProtocolFlags: u8 {
        /// Set for USB 3 ports, clear for USB 2 ports.
        const USB3 = 1 << 0;
        /// USB 2 port that is High-speed Only.
        const HSO = 1 << 1;
        /// The port shares a connector with a port of the other protocol.
        const HAS_PAIR = 1 << 2;
        /// The port of the pair that is currently used.
        const ACTIVE = 1 << 3;
    }
}

#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct PortInfo {
    pub flags: ProtocolFlags,
    /// Index of the port among the ports of its protocol. `None` if no supported protocol
    /// capability lists the port.
    pub offset: Option<usize>,
    /// Zero-based index of the paired port, valid if [ProtocolFlags::HAS_PAIR] is set.
    pub paired: usize,
}

impl PortInfo {
    pub fn is_usb3(&self) -> bool {
        self.offset.is_some() && self.flags.contains(ProtocolFlags::USB3)
    }
    pub fn is_usb2(&self) -> bool {
        self.offset.is_some() && !self.flags.contains(ProtocolFlags::USB3)
    }
    pub fn has_pair(&self) -> bool {
        self.flags.contains(ProtocolFlags::HAS_PAIR)
    }
    pub fn is_active(&self) -> bool {
        self.flags.contains(ProtocolFlags::ACTIVE)
    }
    pub fn pair(&self) -> Option<usize> {
        if self.has_pair() {
            Some(self.paired)
        } else {
            None
        }
    }
}

impl fmt::Debug for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PortInfo")
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("paired", &self.pair())
            .finish()
    }
}

/// Assign every root hub port its protocol and offset within that protocol, then pair the USB 2
/// and USB 3 ports that share an offset.
///
/// All USB 3 ports start out active, as do the USB 2 ports without a pair. The USB 2 half of a
/// pair only becomes active when its USB 3 half fails to reset.
pub fn pair_ports(protocols: &[SupportedProtocol], max_ports: usize) -> Vec<PortInfo> {
    let mut ports = vec![PortInfo::default(); max_ports];

    for &(major, usb3) in &[(USB2_MAJOR, false), (USB3_MAJOR, true)] {
        let mut next_offset = 0;
        for protocol in protocols.iter().filter(|protocol| protocol.major == major) {
            for index in protocol.port_range() {
                let port = match ports.get_mut(index) {
                    Some(port) => port,
                    None => {
                        warn!(
                            "supported protocol {}.x lists port {} beyond the {} root hub ports",
                            major,
                            index + 1,
                            max_ports
                        );
                        continue;
                    }
                };
                port.offset = Some(next_offset);
                next_offset += 1;
                port.flags = if usb3 {
                    ProtocolFlags::USB3
                } else if protocol.high_speed_only() {
                    ProtocolFlags::HSO
                } else {
                    ProtocolFlags::empty()
                };
            }
        }
    }

    for i in 0..ports.len() {
        for j in (i + 1)..ports.len() {
            let (a, b) = (ports[i], ports[j]);
            if a.offset.is_some()
                && a.offset == b.offset
                && a.flags.contains(ProtocolFlags::USB3) != b.flags.contains(ProtocolFlags::USB3)
            {
                ports[i].paired = j;
                ports[i].flags |= ProtocolFlags::HAS_PAIR;
                ports[j].paired = i;
                ports[j].flags |= ProtocolFlags::HAS_PAIR;
            }
        }
    }

    for port in ports.iter_mut() {
        if port.is_usb3() || (port.is_usb2() && !port.has_pair()) {
            port.flags |= ProtocolFlags::ACTIVE;
        }
    }

    let usb2 = ports.iter().filter(|port| port.is_usb2()).count();
    let usb3 = ports.iter().filter(|port| port.is_usb3()).count();
    info!(
        "Found {} ports on root hub, usb2 ports: {}, usb3 ports: {}",
        max_ports, usb2, usb3
    );

    ports
}
