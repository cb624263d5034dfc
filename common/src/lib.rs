//! Helpers shared by the driver crates: register and DMA access, bounded polling and logging.

pub mod dma;
pub mod io;
mod logger;
pub mod timeout;

pub use logger::{file_level, output_level, parse_level, setup_logging};

/// The size of a page as seen by the host. Device-reported page sizes are read from hardware.
pub const PAGE_SIZE: usize = 4096;
