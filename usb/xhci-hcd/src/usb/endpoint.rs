use plain::Plain;

/// The descriptor for a USB Endpoint.
///
/// This is returned as part of the configuration data and cannot be requested individually.
///
/// See USB32 9.6.6. The offsets for the fields in the packet are described in USB32 Table 9-26
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    /// Bits 0-3 are the endpoint number, bit 7 is set for IN endpoints.
    pub address: u8,
    pub attributes: u8,
    /// Bits 0-10 are the packet size, bits 11-12 the additional transactions per microframe.
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_NUMBER_MASK: u8 = 0x0F;
pub const ENDP_ADDR_DIR_IN_BIT: u8 = 1 << 7;

pub const ENDP_MAX_PACKET_SIZE_MASK: u16 = 0x07FF;
pub const ENDP_MAX_BURST_MASK: u16 = 0x1800;
pub const ENDP_MAX_BURST_SHIFT: u8 = 11;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn ty(&self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUMBER_MASK
    }
    pub fn is_in(&self) -> bool {
        self.address & ENDP_ADDR_DIR_IN_BIT != 0
    }
    /// The Device Context Index of this endpoint: twice the endpoint number, plus one for IN.
    pub fn dci(&self) -> u8 {
        self.number() * 2 + u8::from(self.is_in())
    }
    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & ENDP_MAX_PACKET_SIZE_MASK
    }
    pub fn max_burst(&self) -> u8 {
        ((self.max_packet_size & ENDP_MAX_BURST_MASK) >> ENDP_MAX_BURST_SHIFT) as u8
    }
}

unsafe impl Plain for EndpointDescriptor {}

/// The HID class descriptor (HID 6.2.1), found right after a HID interface descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HidDescriptor {
    pub length: u8,
    pub kind: u8,
    pub hid_spec_release: u16,
    pub country_code: u8,
    pub num_descriptors: u8,
    pub report_desc_ty: u8,
    pub report_desc_len: u16,
}

unsafe impl Plain for HidDescriptor {}
