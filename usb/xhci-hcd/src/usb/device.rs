//! Implements the "Device" USB Descriptor.
//!
//! This descriptor is described in USB32 section 9.6.1

/// A USB Device Descriptor.
///
/// This is common to all USB standards, and "provides information that applies globally to the
/// device and all the device's configurations" (USB32 9.6.1)
///
/// USB32 Table 9-11 describes the USB packet offsets of the fields described by this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// bLength, always 18.
    pub length: u8,
    /// bDescriptorType. See [super::DescriptorKind]
    pub kind: u8,
    /// The USB standard version in binary-coded decimal, 0x0320 for USB 3.2.
    pub usb: u16,
    /// bDeviceClass. Zero means each interface names its own class.
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// bMaxPacketSize0. For SuperSpeed devices this is an exponent of two.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    /// bcdDevice
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    /// bNumConfigurations
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

impl DeviceDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        plain::from_bytes::<Self>(bytes).ok().copied()
    }

    /// Gets the USB Minor Version
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    /// Gets the USB Major Version
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
}
