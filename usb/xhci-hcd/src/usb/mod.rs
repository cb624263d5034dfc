//! The Universal Serial Bus (USB) Module
//!
//! Descriptor layouts and standard requests used while enumerating and configuring a device
//! behind an xHCI root-hub port.
//!
//! See the USB 2.0 and USB 3.2 specifications, chapter 9, and the HID 1.11 class definition.
pub use self::config::{
    ConfigDescriptor, Configuration, Descriptors, Interface, CONFIG_DESCRIPTOR_LEN,
};
pub use self::device::{DeviceDescriptor, DEVICE_DESCRIPTOR_LEN};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, HidDescriptor};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{Setup, SetupReq};

/// Enumerates the descriptor kinds this driver requests or walks. (See USB32 Sections 9.5 and 9.6)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    /// A Configuration Descriptor. See [ConfigDescriptor]
    Configuration = 2,
    /// A String Descriptor. See (USB32 Section 9.6.9).
    String = 3,
    /// An Interface Descriptor. See [InterfaceDescriptor]
    Interface = 4,
    /// An Endpoint Descriptor. See [EndpointDescriptor]
    Endpoint = 5,
    /// A Binary Device Object Store Descriptor.
    BinaryObjectStorage = 15,
    /// The HID class descriptor that follows a HID interface. See [HidDescriptor]
    Hid = 0x21,
    /// A HID report descriptor, fetched separately from the configuration.
    HidReport = 0x22,
}

/// bInterfaceClass of the Human Interface Device class.
pub const CLASS_HID: u8 = 3;

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod interface;
pub(crate) mod setup;
