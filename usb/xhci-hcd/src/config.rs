//! Driver configuration, embedded at build time from `xhci.toml`.

use std::time::Duration;

use common::timeout::Timeout;
use lazy_static::lazy_static;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Timeouts {
    pub reset_ms: u32,
    pub legacy_handoff_ms: u32,
    pub command_ms: u32,
    pub transfer_ms: u32,
    pub port_reset_polls: u32,
    pub port_reset_poll_us: u64,
    pub port_power_ms: u64,
    pub reset_recovery_us: u64,
    pub halt_ms: u32,
    pub run_settle_ms: u64,
}

impl Timeouts {
    pub fn reset(&self) -> Timeout {
        Timeout::from_millis(self.reset_ms)
    }
    pub fn legacy_handoff(&self) -> Timeout {
        Timeout::from_millis(self.legacy_handoff_ms)
    }
    pub fn command(&self) -> Timeout {
        Timeout::from_millis(self.command_ms)
    }
    pub fn transfer(&self) -> Timeout {
        Timeout::from_millis(self.transfer_ms)
    }
    pub fn port_reset(&self) -> Timeout {
        Timeout::from_micros(self.port_reset_polls, self.port_reset_poll_us)
    }
    pub fn halt(&self) -> Timeout {
        Timeout::from_millis(self.halt_ms)
    }
    pub fn port_power(&self) -> Duration {
        Duration::from_millis(self.port_power_ms)
    }
    pub fn reset_recovery(&self) -> Duration {
        Duration::from_micros(self.reset_recovery_us)
    }
    pub fn run_settle(&self) -> Duration {
        Duration::from_millis(self.run_settle_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RingSizes {
    pub command_trbs: usize,
    pub transfer_trbs: usize,
    pub event_trbs: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Limits {
    pub max_controllers: usize,
    pub max_root_ports: usize,
    pub irq_numbers: Vec<u8>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Quirks {
    #[serde(default)]
    pub emulator: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogLevels {
    pub output_level: String,
    pub file_level: String,
}

impl LogLevels {
    pub fn output(&self) -> log::LevelFilter {
        common::parse_level(&self.output_level, common::output_level())
    }
    pub fn file(&self) -> log::LevelFilter {
        common::parse_level(&self.file_level, common::file_level())
    }
}

/// A USB class this driver knows how to configure once a device is addressed.
#[derive(Clone, Debug, Deserialize)]
pub struct ClassDriverConfig {
    pub name: String,
    pub class: u8,
}

#[derive(Clone, Debug, Deserialize)]
pub struct XhciConfig {
    pub timeouts: Timeouts,
    pub rings: RingSizes,
    pub limits: Limits,
    #[serde(default)]
    pub quirks: Quirks,
    pub log: LogLevels,
    #[serde(default)]
    pub class_drivers: Vec<ClassDriverConfig>,
}

impl XhciConfig {
    pub fn class_driver(&self, class: u8) -> Option<&ClassDriverConfig> {
        self.class_drivers.iter().find(|driver| driver.class == class)
    }
}

lazy_static! {
    pub static ref XHCI_CONFIG: XhciConfig = {
        // TODO: Load this at runtime.
        const TOML: &'static [u8] = include_bytes!("../xhci.toml");

        toml::from_slice::<XhciConfig>(TOML).expect("Failed to parse internally embedded config file")
    };
}

/// Install the process logger with the configured levels.
pub fn setup_logging(config: &XhciConfig) -> bool {
    common::setup_logging(
        "usb",
        "host",
        "xhci",
        config.log.output(),
        config.log.file(),
    )
}
