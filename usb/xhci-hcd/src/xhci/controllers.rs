//! The table of xHCI controllers the driver has brought up, and the interrupt callbacks that
//! reach them.
//!
//! Controller `n` always uses the `n`-th IRQ number of the configuration, so an IRQ maps back to
//! its controller without any state of its own.
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{error, info, warn};
use spin::{Mutex, RwLock};

use super::{HidReport, Xhci};
use crate::config::XhciConfig;
use crate::platform::{
    InterruptFrame, IrqChip, IrqInstallInfo, IrqPolarity, IrqRegistration, IrqTrigger,
    PciFunction, Platform,
};
use crate::{Result, XhciError};

pub struct XhciControllers {
    platform: Arc<dyn Platform>,
    config: XhciConfig,
    controllers: Vec<RwLock<Option<Arc<Xhci>>>>,
    /// Serializes bring-up, so two probes never claim the same id.
    init_lock: Mutex<()>,
    hid_reports: Option<Sender<HidReport>>,
}

impl XhciControllers {
    /// An empty table. HID report descriptors found while configuring ports go to `hid_reports`.
    pub fn new(
        platform: Arc<dyn Platform>,
        config: XhciConfig,
        hid_reports: Option<Sender<HidReport>>,
    ) -> Arc<Self> {
        let slots = config
            .limits
            .max_controllers
            .min(config.limits.irq_numbers.len());
        Arc::new(Self {
            platform,
            controllers: (0..slots).map(|_| RwLock::new(None)).collect(),
            config,
            init_lock: Mutex::new(()),
            hid_reports,
        })
    }

    /// Bring up the controller behind `pci` and register its interrupt. Port enumeration starts
    /// once the interrupt subsystem enables the line. Returns the controller id.
    pub fn xhci_init(self: &Arc<Self>, pci: Arc<dyn PciFunction>) -> Result<usize> {
        let _guard = self.init_lock.lock();

        let id = self
            .controllers
            .iter()
            .position(|slot| slot.read().is_none())
            .ok_or_else(|| {
                error!("xhci: Cannot initialize more than {} controllers", self.controllers.len());
                XhciError::NoController
            })?;
        let irq = self.irq_of(id).ok_or(XhciError::NoController)?;

        let xhci = Xhci::new(
            id,
            pci,
            Arc::clone(&self.platform),
            self.config.clone(),
            self.hid_reports.clone(),
        )
        .map_err(|err| {
            error!("xHCI {}: failed to set up controller: {}", id, err);
            err
        })?;
        xhci.init().map_err(|err| {
            error!("xHCI {}: failed to initialize controller: {}", id, err);
            err
        })?;

        *self.controllers[id].write() = Some(Arc::new(xhci));

        let registration = IrqRegistration {
            name: format!("xHCI HC{}", id),
            parameter: id,
            info: IrqInstallInfo {
                processor: 0,
                trigger: IrqTrigger::Edge,
                polarity: IrqPolarity::Assert,
            },
            chip: Arc::clone(self) as Arc<dyn IrqChip>,
        };
        if let Err(err) = self.platform.irq_register(irq, registration) {
            error!("xHCI {}: failed to register irq {}: {}", id, irq, err);
            *self.controllers[id].write() = None;
            return Err(err);
        }

        info!("xHCI {}: Successfully initialized, irq {}", id, irq);
        Ok(id)
    }

    pub fn get(&self, id: usize) -> Option<Arc<Xhci>> {
        self.controllers.get(id)?.read().clone()
    }

    /// Number of controllers brought up.
    pub fn count(&self) -> usize {
        self.controllers
            .iter()
            .filter(|slot| slot.read().is_some())
            .count()
    }

    pub fn irq_of(&self, id: usize) -> Option<u8> {
        if id < self.controllers.len() {
            self.config.limits.irq_numbers.get(id).copied()
        } else {
            None
        }
    }

    fn controller_of_irq(&self, irq: u8) -> Option<Arc<Xhci>> {
        let id = self
            .config
            .limits
            .irq_numbers
            .iter()
            .position(|&n| n == irq)?;
        let xhci = self.get(id);
        if xhci.is_none() {
            warn!("xhci: irq {} has no controller", irq);
        }
        xhci
    }
}

impl IrqChip for XhciControllers {
    fn install(&self, irq: u8, _info: &IrqInstallInfo) -> Result<()> {
        let xhci = self.controller_of_irq(irq).ok_or(XhciError::NoController)?;
        xhci.pci().install_msi(irq)
    }

    fn uninstall(&self, irq: u8) {
        if let Some(xhci) = self.controller_of_irq(irq) {
            if let Err(err) = xhci.hc_stop() {
                error!("xHCI {}: failed to stop: {}", xhci.id(), err);
            }
        }
    }

    fn enable(&self, irq: u8) {
        if let Some(xhci) = self.controller_of_irq(irq) {
            xhci.pci().start_msi();
            xhci.start_sched();
            xhci.start_ports();
        }
    }

    fn disable(&self, irq: u8) {
        if let Some(xhci) = self.controller_of_irq(irq) {
            xhci.stop_sched();
            xhci.pci().stop_msi();
        }
    }

    fn ack(&self, _irq: u8) {}

    fn handle(&self, irq: u8, parameter: usize, _frame: &InterruptFrame) {
        match self.get(parameter) {
            Some(xhci) => xhci.irq_handler(),
            None => warn!("xhci: irq {} for unknown controller {}", irq, parameter),
        }
    }
}
