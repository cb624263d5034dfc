use super::DescriptorKind;

/// The eight-byte SETUP packet that opens every control transfer. (USB32 9.3)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Standard device-to-host request
pub const REQ_TYPE_GET: u8 = 0x80;
/// Standard host-to-device request
pub const REQ_TYPE_SET: u8 = 0x00;
/// Standard device-to-host request addressed to an interface
pub const REQ_TYPE_GET_INTERFACE: u8 = 0x81;
/// Class host-to-device request addressed to an interface
pub const REQ_TYPE_SET_CLASS_INTERFACE: u8 = 0x21;

/// HID class SET_IDLE request number (HID 7.2)
pub const HID_REQ_SET_IDLE: u8 = 0x0A;

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;

impl Setup {
    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    /// The packet as the little-endian parameter of a Setup Stage TRB.
    pub fn to_param(&self) -> u64 {
        u64::from(self.kind)
            | (u64::from(self.request) << 8)
            | (u64::from(self.value) << 16)
            | (u64::from(self.index) << 32)
            | (u64::from(self.length) << 48)
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: REQ_TYPE_GET,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: REQ_TYPE_SET,
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    /// HID SET_IDLE with an indefinite duration for all reports. (HID 7.2.4)
    pub const fn hid_set_idle(interface: u8) -> Self {
        Self {
            kind: REQ_TYPE_SET_CLASS_INTERFACE,
            request: HID_REQ_SET_IDLE,
            value: 0,
            index: interface as u16,
            length: 0,
        }
    }

    /// GET_DESCRIPTOR for the report descriptor of a HID interface. (HID 7.1.1)
    pub const fn get_hid_report_descriptor(interface: u8, length: u16) -> Self {
        Self {
            kind: REQ_TYPE_GET_INTERFACE,
            request: SetupReq::GetDescriptor as u8,
            value: (DescriptorKind::HidReport as u16) << 8,
            index: interface as u16,
            length,
        }
    }
}
