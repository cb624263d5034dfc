use plain::Plain;
use smallvec::SmallVec;

use super::{DescriptorKind, EndpointDescriptor, HidDescriptor, InterfaceDescriptor};
use crate::{Result, XhciError};

/// A Configuration Descriptor (USB32 9.6.3), the 9-byte header of a device configuration.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    /// Length of the configuration including every descriptor that follows the header.
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl Plain for ConfigDescriptor {}

pub const CONFIG_DESCRIPTOR_LEN: usize = 9;

/// Walks the descriptors packed back to back in a configuration, yielding `(kind, bytes)`.
///
/// Iteration stops at the first descriptor whose length field is too short or runs past the end
/// of the buffer.
pub struct Descriptors<'a> {
    buf: &'a [u8],
}

impl<'a> Descriptors<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = usize::from(*self.buf.first()?);
        if len < 2 || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let (desc, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some((desc[1], desc))
    }
}

fn parse<T: Plain + Copy>(bytes: &[u8], what: &'static str) -> Result<T> {
    plain::from_bytes::<T>(bytes)
        .map(|desc| *desc)
        .map_err(|_| XhciError::Invalid(what))
}

/// An interface of a configuration, with the descriptors that follow it.
#[derive(Clone, Debug)]
pub struct Interface {
    pub desc: InterfaceDescriptor,
    pub endpoints: SmallVec<[EndpointDescriptor; 4]>,
    pub hid: Option<HidDescriptor>,
}

/// A full configuration as returned by GET_DESCRIPTOR(Configuration) with `total_length` bytes.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub desc: ConfigDescriptor,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut descriptors = Descriptors::new(buf);

        let desc = match descriptors.next() {
            Some((kind, bytes)) if kind == DescriptorKind::Configuration as u8 => {
                parse::<ConfigDescriptor>(bytes, "configuration descriptor")?
            }
            _ => return Err(XhciError::Invalid("configuration descriptor")),
        };

        let mut interfaces: Vec<Interface> = Vec::new();
        for (kind, bytes) in descriptors {
            if kind == DescriptorKind::Interface as u8 {
                interfaces.push(Interface {
                    desc: parse(bytes, "interface descriptor")?,
                    endpoints: SmallVec::new(),
                    hid: None,
                });
            } else if kind == DescriptorKind::Endpoint as u8 {
                if let Some(interface) = interfaces.last_mut() {
                    interface
                        .endpoints
                        .push(parse(bytes, "endpoint descriptor")?);
                }
            } else if kind == DescriptorKind::Hid as u8 {
                if let Some(interface) = interfaces.last_mut() {
                    interface.hid = Some(parse(bytes, "HID descriptor")?);
                }
            }
        }

        Ok(Self { desc, interfaces })
    }

    /// The default alternate setting of interface `number`.
    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|interface| interface.desc.number == number && interface.desc.alternate_setting == 0)
    }
}
