//! Host controller driver for xHCI USB controllers.
//!
//! The driver brings up a controller found on the PCI bus, resets and enumerates the devices on
//! its root hub ports, and hands the report descriptors of HID devices to a class driver. The
//! services it needs from the kernel (PCI configuration, register mapping, DMA memory, delays and
//! interrupt registration) are reached through the traits in [platform].
//!
//! Entry point is [xhci::XhciControllers::xhci_init].
#[macro_use]
extern crate bitflags;
extern crate plain;

pub mod config;
pub mod error;
pub mod platform;
pub mod usb;
pub mod xhci;

pub use crate::config::{XhciConfig, XHCI_CONFIG};
pub use crate::error::{Result, XhciError};
pub use crate::xhci::{HidReport, Xhci, XhciControllers};
