use common::io::Io;

/// CAPLENGTH in XHC Table 5-9
pub const CAP_CAPLENGTH: usize = 0x00;
/// HCIVERSION in XHC Table 5-9
pub const CAP_HCIVERSION: usize = 0x02;
/// HCSPARAMS1 in XHC Table 5-9
pub const CAP_HCSPARAMS1: usize = 0x04;
/// HCSPARAMS2 in XHC Table 5-9
pub const CAP_HCSPARAMS2: usize = 0x08;
/// HCSPARAMS3 in XHC Table 5-9
pub const CAP_HCSPARAMS3: usize = 0x0C;
/// HCCPARAMS1 in XHC Table 5-9
pub const CAP_HCCPARAMS1: usize = 0x10;
/// DBOFF in XHC Table 5-9
pub const CAP_DBOFF: usize = 0x14;
/// RTSOFF in XHC Table 5-9
pub const CAP_RTSOFF: usize = 0x18;
/// HCCPARAMS2 in XHC Table 5-9
pub const CAP_HCCPARAMS2: usize = 0x1C;

/// A snapshot of the Capability Registers of the XHCI
///
/// These are read-only registers that specify the capabilities of the host controller
/// implementation, so they are read once during bring-up and kept.
///
/// See XHCI Section 5.3. Table 5-9 describes the offsets of the registers in memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilityRegs {
    /// The length of the Capability Registers; the operational registers start right after.
    ///
    /// CAPLENGTH in XHC Table 5-9. See XHC 5.3.1
    pub len: u8,
    /// The XHCI interface version number in Binary-Encoded Decimal.
    ///
    /// HCIVERSION in XHC Table 5-9
    pub hci_ver: u16,
    /// The HCI Structural Parameters 1 Register.
    ///
    /// -Bits 0 - 7 describe the number of device slots supported by this controller
    /// -Bits 8 - 18 describe the number of interrupters supported by this controller
    /// -Bits 19-23 are reserved
    /// -Bits 24-31 specify the maximum number of ports supported by this controller.
    ///
    /// HCPARAMS1 in XHC Table 5-9. See 5.3.3
    pub hcs_params1: u32,
    /// The HCI Structural Parameters 2 Register.
    ///
    /// - Bits 0-3 describe the Isochronus Scheduling Threshold (IST)
    /// - Bits 4-7 describe the Event Ring Segment Table Max (ERST Max). The maximum number of event
    /// ring segment table entries is 2^(ERST Max)
    /// - Bits 21-25 describe the high order five bits of the maximum number of scratchpad buffers
    /// - Bit  26 is the Scratchpad Restore Buffer (SPR). (See XHC 4.23.2)
    /// - Bits 27-31 describe the low order five bits of the maximum number of scratchpad buffers
    ///
    /// HCPARAMS2 in XHC Table 5-9. See 5.3.4
    pub hcs_params2: u32,
    /// HCPARAMS3 in XHC Table 5-9. See XHC 5.3.5
    pub hcs_params3: u32,
    /// The HCI Capability Parameters 1 Register.
    ///
    /// - Bit 0 is the 64-bit Address Capability Flag (AC64).
    /// - Bit 2 is the Context Size Flag (CSZ). 0 = 32-byte, 1 = 64-byte Context Data Structures
    /// - Bits 16-31 The xHCI Extended Capabilities Pointer (xECP), in DWORDs from the base.
    ///
    /// HCCPARAMS1 in XHC Table 5-9. See XHC 5.3.6
    pub hcc_params1: u32,
    /// The Doorbell Offset Register. Bits 2-31 contain the offset.
    ///
    /// DBOFF in XHC Table 5-9. See XHC 5.3.7
    pub db_offset: u32,
    /// The Runtime Register Space Offset. Bits 5-31 contain the offset.
    ///
    /// RTSOFF in XHC Table 5-9. See XHC 5.3.8
    pub rts_offset: u32,
    /// HCCPARAMS2 in XHC Table 5-9. See XHC 5.3.9
    pub hcc_params2: u32,
}

/// The mask to use to get the AC64 bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_AC64_BIT: u32 = 1 << 0;
/// The mask to use to get the CSZ bit from HCCPARAMS1. See [CapabilityRegs]
pub const HCC_PARAMS1_CSZ_BIT: u32 = 1 << 2;
/// The mask to use to get the XECP value from HCCParams1. See [CapabilityRegs]
pub const HCC_PARAMS1_XECP_MASK: u32 = 0xFFFF_0000;
/// The shift to use to get the XECP value from HCCParams1. See [CapabilityRegs]
pub const HCC_PARAMS1_XECP_SHIFT: u8 = 16;

/// The mask to use to get MAXPORTS from HCSParams1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_PORTS_MASK: u32 = 0xFF00_0000;
/// The shift to use to get MAXPORTS from HCSParams1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_PORTS_SHIFT: u8 = 24;
/// The mask to use to get MAXINTRS from HCSParams1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_INTRS_MASK: u32 = 0x0007_FF00;
/// The shift to use to get MAXINTRS from HCSParams1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_INTRS_SHIFT: u8 = 8;
/// The mask to use to get MAXSLOTS from HCSParams1. See [CapabilityRegs]
pub const HCS_PARAMS1_MAX_SLOTS_MASK: u32 = 0x0000_00FF;

/// The mask to use to get ERST Max from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_ERST_MAX_MASK: u32 = 0x0000_00F0;
/// The shift to use to get ERST Max from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_ERST_MAX_SHIFT: u8 = 4;
/// The mask to use to get MAXSCRATPADBUFS_LO from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK: u32 = 0xF800_0000;
/// The shift to use to get MAXSCRATCHPADBUFS_LO from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT: u8 = 27;
/// The mask to use to get the SPR bit from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_SPR_BIT: u32 = 1 << 26;
/// The mask to use to get MAXSCRATCHPADBUFS_HI from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK: u32 = 0x03E0_0000;
/// The shift to use to get MAXSCRATCHPADBUFS_HI from HCSParams2. See [CapabilityRegs]
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT: u8 = 21;

pub const DBOFF_MASK: u32 = !0x3;
pub const RTSOFF_MASK: u32 = !0x1F;

/// The lowest interface version this driver has been written against.
pub const MIN_HCI_VERSION: u16 = 0x95;

impl CapabilityRegs {
    /// Read every capability register of the window.
    pub fn read(io: &dyn Io) -> Self {
        Self {
            len: io.read8(CAP_CAPLENGTH),
            hci_ver: io.read16(CAP_HCIVERSION),
            hcs_params1: io.read32(CAP_HCSPARAMS1),
            hcs_params2: io.read32(CAP_HCSPARAMS2),
            hcs_params3: io.read32(CAP_HCSPARAMS3),
            hcc_params1: io.read32(CAP_HCCPARAMS1),
            db_offset: io.read32(CAP_DBOFF),
            rts_offset: io.read32(CAP_RTSOFF),
            hcc_params2: io.read32(CAP_HCCPARAMS2),
        }
    }

    /// Gets the ACS64 bit from HCCParams1.
    pub fn ac64(&self) -> bool {
        self.hcc_params1 & HCC_PARAMS1_AC64_BIT != 0
    }

    /// Gets the context size (CSZ) bit from HCCParams1.
    pub fn csz(&self) -> bool {
        self.hcc_params1 & HCC_PARAMS1_CSZ_BIT != 0
    }

    /// The size in bytes of one slot or endpoint context, 32 or 64.
    pub fn context_size(&self) -> usize {
        if self.csz() {
            64
        } else {
            32
        }
    }

    /// Gets the maximum number of ports from HCSParams1
    pub fn max_ports(&self) -> u8 {
        ((self.hcs_params1 & HCS_PARAMS1_MAX_PORTS_MASK) >> HCS_PARAMS1_MAX_PORTS_SHIFT) as u8
    }

    /// Gets the maximum number of device slots from HCSParams1
    pub fn max_slots(&self) -> u8 {
        (self.hcs_params1 & HCS_PARAMS1_MAX_SLOTS_MASK) as u8
    }

    /// Gets the number of interrupters from HCSParams1
    pub fn max_intrs(&self) -> u16 {
        ((self.hcs_params1 & HCS_PARAMS1_MAX_INTRS_MASK) >> HCS_PARAMS1_MAX_INTRS_SHIFT) as u16
    }

    /// The maximum number of event ring segment table entries, 2^(ERST Max).
    pub fn max_erst_entries(&self) -> u32 {
        1 << ((self.hcs_params2 & HCS_PARAMS2_ERST_MAX_MASK) >> HCS_PARAMS2_ERST_MAX_SHIFT)
    }

    /// Gets the extended capability pointer from HCCParams1 in DWORDs.
    pub fn ext_caps_ptr_in_dwords(&self) -> u16 {
        ((self.hcc_params1 & HCC_PARAMS1_XECP_MASK) >> HCC_PARAMS1_XECP_SHIFT) as u16
    }

    /// Byte offset of the first extended capability, or `None` if there are none.
    pub fn ext_caps_offset(&self) -> Option<usize> {
        match self.ext_caps_ptr_in_dwords() {
            0 => None,
            dwords => Some(usize::from(dwords) << 2),
        }
    }

    pub fn doorbell_offset(&self) -> usize {
        (self.db_offset & DBOFF_MASK) as usize
    }

    pub fn runtime_offset(&self) -> usize {
        (self.rts_offset & RTSOFF_MASK) as usize
    }

    /// Gets the SPR register from HCSParams2
    pub fn spr(&self) -> bool {
        self.hcs_params2 & HCS_PARAMS2_SPR_BIT != 0
    }

    /// Gets the maximum number of scratchpad buffers supported by this implementation.
    pub fn max_scratchpad_bufs(&self) -> u16 {
        let lo = (self.hcs_params2 & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT;
        let hi = (self.hcs_params2 & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT;
        (lo | (hi << 5)) as u16
    }
}
