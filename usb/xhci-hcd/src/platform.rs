//! Services the driver consumes from the rest of the kernel.
//!
//! PCI configuration, memory mapping, DMA allocation, delays and interrupt registration are not
//! implemented here; a kernel (or a test harness) supplies them through these traits.

use std::sync::Arc;
use std::time::Duration;

use common::dma::DmaAllocator;
use common::io::Io;

use crate::Result;

/// One PCI function, as handed to the driver by bus enumeration.
pub trait PciFunction: Send + Sync {
    fn vendor_id(&self) -> u16;
    fn device_id(&self) -> u16;
    fn revision(&self) -> u8;

    /// Physical address of BAR0, already decoded from a 32- or 64-bit BAR.
    fn bar0(&self) -> u64;

    /// Set the memory space and bus master bits of the command register.
    fn enable_memory_and_bus_master(&self);

    fn read_config(&self, offset: u16) -> u32;
    fn write_config(&self, offset: u16, value: u32);

    /// Program the function's MSI/MSI-X capability to deliver `irq`.
    fn install_msi(&self, irq: u8) -> Result<()>;
    fn start_msi(&self);
    fn stop_msi(&self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrqTrigger {
    Edge,
    Level,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IrqPolarity {
    Assert,
    Deassert,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IrqInstallInfo {
    /// Index of the processor the interrupt is delivered to.
    pub processor: u8,
    pub trigger: IrqTrigger,
    pub polarity: IrqPolarity,
}

/// Register state of the interrupted context, as captured by the interrupt entry code.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptFrame {
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub flags: u64,
}

/// Callbacks the interrupt subsystem invokes for a registered line.
pub trait IrqChip: Send + Sync {
    fn install(&self, irq: u8, info: &IrqInstallInfo) -> Result<()>;
    fn uninstall(&self, irq: u8);
    fn enable(&self, irq: u8);
    fn disable(&self, irq: u8);
    fn ack(&self, irq: u8);

    /// The handler proper. `parameter` is the value given at registration.
    fn handle(&self, irq: u8, parameter: usize, frame: &InterruptFrame);
}

pub struct IrqRegistration {
    pub name: String,
    pub parameter: usize,
    pub info: IrqInstallInfo,
    pub chip: Arc<dyn IrqChip>,
}

pub trait Platform: Send + Sync {
    /// Map `len` bytes of device memory at physical address `phys`. The mapping lives as long as
    /// the returned window.
    fn map_registers(&self, phys: u64, len: usize) -> Result<Box<dyn Io>>;

    fn dma(&self) -> Arc<dyn DmaAllocator>;

    /// Wait at least `duration`. Called from polling loops.
    fn delay(&self, duration: Duration);

    /// Register an interrupt line. The subsystem calls [IrqChip::install] and then
    /// [IrqChip::enable] once the line is live.
    fn irq_register(&self, irq: u8, registration: IrqRegistration) -> Result<()>;
}
