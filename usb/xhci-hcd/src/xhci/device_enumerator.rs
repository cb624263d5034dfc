//! Bringing up the devices behind the root hub ports.
//!
//! Every active port goes through the same sequence: reset, Enable Slot, a first Address Device
//! with BSR set and an 8-byte device descriptor read, a second reset, a second Address Device and
//! the full 18-byte device descriptor. Some devices only answer with the first 8 bytes of the
//! descriptor while in the default state, which is why the descriptor is read twice.
//!
//! Any failure abandons the port; enumeration of the other ports continues.
use log::{debug, error, info, warn};

use super::context::{
    DeviceContext, EndpointContext, InputContext, SlotContext, DEFAULT_ERROR_COUNT,
};
use super::port::{PortFlags, PortSpeed, ProtocolFlags};
use super::ring::Ring;
use super::transfer::CONTROL_DCI;
use super::trb::{Trb, TrbCompletionCode};
use super::{HidReport, PortState, Xhci};
use crate::usb::{
    self, Configuration, ConfigDescriptor, DescriptorKind, DeviceDescriptor, EndpointDescriptor,
    EndpointTy, Setup, CONFIG_DESCRIPTOR_LEN, DEVICE_DESCRIPTOR_LEN,
};
use crate::{Result, XhciError};

/// Bytes of the device descriptor every device returns in the default state.
const DEVICE_DESCRIPTOR_PREFIX_LEN: usize = 8;

impl Xhci {
    /// Power and reset root hub port `port` (zero-based) and wait for it to become enabled.
    ///
    /// USB 3 ports get a warm reset. When a USB 2 port comes up, its USB 3 pair stops being the
    /// active half; when a USB 3 port fails, its USB 2 pair takes over.
    pub fn reset_port(&self, port: usize) -> Result<()> {
        let info = self
            .port_info(port)
            .ok_or(XhciError::Invalid("root hub port"))?;
        let regs = self.port_regs(port);

        if !regs.flags().contains(PortFlags::PP) {
            debug!("xHCI {}: port {} is powered off, starting...", self.id, port);
            regs.write(PortFlags::PP);
            self.delay(self.config.timeouts.port_power());
            if !regs.flags().contains(PortFlags::PP) {
                warn!("xHCI {}: cannot power on port {}", self.id, port);
                return Err(XhciError::Again);
            }
        }

        regs.write(PortFlags::PP | PortFlags::CHANGE_BITS);
        let reset_bit = if info.is_usb3() {
            PortFlags::WPR
        } else {
            PortFlags::PR
        };
        regs.write(PortFlags::PP | reset_bit);

        let result = self.wait_port_reset(port, reset_bit);
        self.update_port_activity(port, result.is_ok());
        result
    }

    fn wait_port_reset(&self, port: usize, reset_bit: PortFlags) -> Result<()> {
        let regs = self.port_regs(port);

        let mut timeout = self.config.timeouts.port_reset();
        loop {
            let flags = regs.flags();
            if flags.contains(PortFlags::PRC)
                || (self.config.quirks.emulator && !flags.contains(reset_bit))
            {
                break;
            }
            timeout.run(|d| self.delay(d)).map_err(|()| {
                warn!("xHCI {}: port {} reset timed out", self.id, port);
                XhciError::Timeout("port reset")
            })?;
        }

        self.delay(self.config.timeouts.reset_recovery());

        if regs.flags().contains(PortFlags::PED) {
            regs.write(PortFlags::PP | PortFlags::CHANGE_BITS);
            debug!("xHCI {}: port {} reset", self.id, port);
            Ok(())
        } else {
            warn!(
                "xHCI {}: port {} not enabled after reset, PORTSC {:#010x}",
                self.id,
                port,
                regs.read()
            );
            Err(XhciError::Io)
        }
    }

    fn update_port_activity(&self, port: usize, reset_ok: bool) {
        let mut ports = self.ports.lock();
        let info = match ports.get(port) {
            Some(info) => *info,
            None => return,
        };

        if reset_ok && info.is_usb2() {
            ports[port].flags |= ProtocolFlags::ACTIVE;
            if let Some(pair) = info.pair().filter(|&pair| pair < ports.len()) {
                ports[pair].flags.remove(ProtocolFlags::ACTIVE);
            }
        } else if !reset_ok && info.is_usb3() {
            ports[port].flags.remove(ProtocolFlags::ACTIVE);
            if let Some(pair) = info.pair().filter(|&pair| pair < ports.len()) {
                debug!(
                    "xHCI {}: USB 3 port {} failed, falling back to USB 2 port {}",
                    self.id, port, pair
                );
                ports[pair].flags |= ProtocolFlags::ACTIVE;
            }
        }
    }

    /// Allocate the device context of `slot` with its default control endpoint and transfer ring,
    /// and hook it into the DCBAA.
    pub fn initialize_slot(
        &self,
        state: &mut PortState,
        port: usize,
        slot: u8,
        speed: PortSpeed,
    ) -> Result<()> {
        let device_context = DeviceContext::new(&self.dma, self.cap.context_size())?;
        let ring = Ring::new(&self.dma, self.config.rings.transfer_trbs)?;

        device_context.set_slot(&SlotContext::root_port_device(port, speed as u8));
        device_context.set_endpoint(
            CONTROL_DCI,
            &EndpointContext::control(state.control_max_packet, ring.register()),
        );
        self.dcbaa.set(slot, device_context.physical());

        debug!(
            "xHCI {}: slot {} on port {}, device context at {:#x}",
            self.id,
            slot,
            port,
            device_context.physical()
        );

        state.slot = slot;
        state.speed = Some(speed);
        state.device_context = Some(device_context);
        state.rings.clear();
        state.rings.insert(CONTROL_DCI, ring);
        Ok(())
    }

    /// Issue Address Device for the slot of `state`, from its current device context. With
    /// `block`, the controller moves the slot to the default state without sending SET_ADDRESS.
    pub fn set_address(&self, state: &PortState, block: bool) -> Result<()> {
        let device_context = state
            .device_context
            .as_ref()
            .ok_or(XhciError::Invalid("device context"))?;

        let input = InputContext::new(&self.dma, self.cap.context_size())?;
        input.set_add_flags(0x3);
        input.set_slot(&device_context.slot());
        let mut ep0 = device_context.endpoint(CONTROL_DCI);
        ep0.set_error_count(DEFAULT_ERROR_COUNT);
        // The controller restarts the control ring from here; it may have moved since last time.
        if let Some(ring) = state.rings.get(&CONTROL_DCI) {
            ep0.set_dequeue(ring.register());
        }
        input.set_endpoint(CONTROL_DCI, &ep0);

        let mut trb = Trb::default();
        trb.address_device(state.slot, input.physical(), block);
        let done = self.send_command(trb, true).map_err(|err| {
            error!("xHCI {}: slot {} address device failed", self.id, state.slot);
            err
        })?;

        if done.completion_code() != TrbCompletionCode::Success as u8 {
            error!(
                "xHCI {}: slot {} address device completed with code {}",
                self.id,
                state.slot,
                done.completion_code()
            );
            return Err(XhciError::Again);
        }

        let slot = device_context.slot();
        let ep0 = device_context.endpoint(CONTROL_DCI);
        debug!(
            "xHCI {}: slot {} state {:?} address {}, ep0 state {} max packet {}",
            self.id,
            state.slot,
            slot.slot_state(),
            slot.device_address(),
            ep0.state(),
            ep0.max_packet_size()
        );
        Ok(())
    }

    /// Enumerate the device on `port`, which must have been reset: assign it a slot, address it
    /// and read its device descriptor.
    pub fn enumerate(&self, port: usize) -> Result<DeviceDescriptor> {
        let mut state = self
            .port_states
            .get(port)
            .ok_or(XhciError::Invalid("root hub port"))?
            .lock();

        let raw_speed = self.port_regs(port).speed();
        let speed = PortSpeed::from_raw(raw_speed).ok_or_else(|| {
            warn!("xHCI {}: port {} has unknown speed {}", self.id, port, raw_speed);
            XhciError::Invalid("port speed")
        })?;

        let slot = self.enable_slot(0).map_err(|err| {
            error!("xHCI {}: port {}: send enable slot failed", self.id, port);
            err
        })?;

        state.control_max_packet = speed.default_max_packet_size();
        self.initialize_slot(&mut state, port, slot, speed)?;

        self.set_address(&state, true)?;

        let mut prefix = [0u8; DEVICE_DESCRIPTOR_PREFIX_LEN];
        self.control_in(
            &mut state,
            Setup::get_descriptor(
                DescriptorKind::Device,
                0,
                0,
                DEVICE_DESCRIPTOR_PREFIX_LEN as u16,
            ),
            &mut prefix,
        )?;
        debug!(
            "xHCI {}: port {} bMaxPacketSize0 {}",
            self.id, port, prefix[7]
        );

        self.reset_port(port)?;
        self.set_address(&state, false)?;

        let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
        self.control_in(
            &mut state,
            Setup::get_descriptor(DescriptorKind::Device, 0, 0, DEVICE_DESCRIPTOR_LEN as u16),
            &mut raw,
        )?;
        let desc =
            DeviceDescriptor::from_bytes(&raw).ok_or(XhciError::Invalid("device descriptor"))?;
        state.dev_desc = Some(desc);

        let release = desc.release;
        info!(
            "xHCI {}: found USB device on port {}: version {:01X}.{:02X}, class {}, subclass {}, \
             protocol {}, max packet size {}, vendor {:#06x}, product {:#06x}, release {:04x}, \
             strings {}/{}/{}, {} configuration(s)",
            self.id,
            port,
            desc.major_usb_vers(),
            desc.minor_usb_vers(),
            desc.class,
            desc.sub_class,
            desc.protocol,
            desc.packet_size,
            { desc.vendor },
            { desc.product },
            release,
            desc.manufacturer_str,
            desc.product_str,
            desc.serial_str,
            desc.configurations
        );

        Ok(desc)
    }

    /// Issue Configure Endpoint for one interrupt endpoint of the device in `state`, with a new
    /// transfer ring.
    pub fn configure_endpoint(
        &self,
        state: &mut PortState,
        endpoint: &EndpointDescriptor,
    ) -> Result<()> {
        let device_context = state
            .device_context
            .as_ref()
            .ok_or(XhciError::Invalid("device context"))?;
        let dci = endpoint.dci();
        let ring = Ring::new(&self.dma, self.config.rings.transfer_trbs)?;

        let input = InputContext::new(&self.dma, self.cap.context_size())?;
        input.set_add_flags((1 << dci) | 1);
        input.set_control(1);

        let mut slot = device_context.slot();
        slot.set_context_entries(dci.max(slot.context_entries()));
        input.set_slot(&slot);
        input.set_endpoint(
            dci,
            &EndpointContext::interrupt(
                dci,
                endpoint.max_packet(),
                endpoint.max_burst(),
                endpoint.interval,
                ring.register(),
            ),
        );
        input.dump_control();

        let mut trb = Trb::default();
        trb.configure_endpoint(state.slot, input.physical());
        let done = self.send_command(trb, true)?;
        if done.completion_code() != TrbCompletionCode::Success as u8 {
            error!(
                "xHCI {}: slot {} configure endpoint {} completed with code {}",
                self.id,
                state.slot,
                dci,
                done.completion_code()
            );
            return Err(XhciError::Completion {
                code: done.completion_code(),
            });
        }

        debug!(
            "xHCI {}: slot {} endpoint {} configured, state {}",
            self.id,
            state.slot,
            dci,
            device_context.endpoint(dci).state()
        );
        state.rings.insert(dci, ring);
        Ok(())
    }

    fn fetch_configuration(&self, state: &mut PortState) -> Result<Configuration> {
        let mut header = [0u8; CONFIG_DESCRIPTOR_LEN];
        self.control_in(
            state,
            Setup::get_descriptor(
                DescriptorKind::Configuration,
                0,
                0,
                CONFIG_DESCRIPTOR_LEN as u16,
            ),
            &mut header,
        )?;
        let desc = *plain::from_bytes::<ConfigDescriptor>(&header)
            .map_err(|_| XhciError::Invalid("configuration descriptor"))?;

        let total_length = desc.total_length;
        if usize::from(total_length) < CONFIG_DESCRIPTOR_LEN {
            return Err(XhciError::Invalid("configuration descriptor"));
        }

        let mut buf = vec![0u8; usize::from(total_length)];
        self.control_in(
            state,
            Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, total_length),
            &mut buf,
        )?;
        Configuration::parse(&buf)
    }

    /// Configure the enumerated device on `port` for the class driver of its first interface.
    ///
    /// Only classes listed in the class driver table are configured. For a HID interface this
    /// selects the configuration, configures its interrupt endpoint, sets it idle and sends its
    /// report descriptor to the HID consumer. Returns whether a class driver took the device.
    pub fn configure_port(&self, port: usize) -> Result<bool> {
        let mut state = self
            .port_states
            .get(port)
            .ok_or(XhciError::Invalid("root hub port"))?
            .lock();
        if state.slot == 0 {
            return Err(XhciError::Invalid("port not enumerated"));
        }

        let config = self.fetch_configuration(&mut state)?;
        let interface = config
            .interface(0)
            .ok_or(XhciError::Invalid("interface 0"))?
            .clone();

        let class = interface.desc.class;
        let driver = match self.config.class_driver(class) {
            Some(driver) => driver,
            None => {
                info!(
                    "xHCI {}: port {}: no class driver for class {}",
                    self.id, port, class
                );
                return Ok(false);
            }
        };
        if class != usb::CLASS_HID {
            warn!(
                "xHCI {}: port {}: class driver {} is not supported",
                self.id, port, driver.name
            );
            return Ok(false);
        }

        let endpoint = interface
            .endpoints
            .first()
            .copied()
            .ok_or(XhciError::Invalid("HID interface without endpoints"))?;
        if endpoint.ty() != EndpointTy::Interrupt {
            return Err(XhciError::Invalid("HID endpoint type"));
        }

        self.control_out(
            &mut state,
            Setup::set_configuration(config.desc.configuration_value),
            &[],
        )?;
        self.configure_endpoint(&mut state, &endpoint)?;

        let number = interface.desc.number;
        self.control_out(&mut state, Setup::hid_set_idle(number), &[])?;

        let hid = interface
            .hid
            .ok_or(XhciError::Invalid("HID descriptor"))?;
        let report_len = hid.report_desc_len;
        let mut descriptor = vec![0u8; usize::from(report_len)];
        self.control_in(
            &mut state,
            Setup::get_hid_report_descriptor(number, report_len),
            &mut descriptor,
        )?;
        info!(
            "xHCI {}: port {}: {} interface {}, {}-byte report descriptor",
            self.id, port, driver.name, number, report_len
        );

        if let Some(sender) = &self.hid_reports {
            let report = HidReport {
                controller: self.id,
                port,
                slot: state.slot,
                interface: number,
                descriptor,
            };
            if sender.send(report).is_err() {
                warn!("xHCI {}: HID consumer is gone", self.id);
            }
        }
        Ok(true)
    }

    fn start_port(&self, port: usize) -> bool {
        if let Err(err) = self.reset_port(port) {
            warn!("xHCI {}: port {} reset failed: {}", self.id, port, err);
            return false;
        }
        match self.enumerate(port) {
            Ok(_) => true,
            Err(err) => {
                error!("xHCI {}: port {} enumeration failed: {}", self.id, port, err);
                false
            }
        }
    }

    /// Reset and enumerate every active USB 3 port, then every port of the USB 2 ports that is
    /// active by then, and configure what was found. Returns the number of enumerated ports.
    pub fn start_ports(&self) -> usize {
        let mut started = Vec::new();

        for port in 0..self.port_count() {
            let info = self.port_info(port).unwrap_or_default();
            if info.is_usb3() && info.is_active() && self.start_port(port) {
                started.push(port);
            }
        }
        debug!("xHCI {}: {} active USB 3 ports", self.id, started.len());

        for port in 0..self.port_count() {
            let info = self.port_info(port).unwrap_or_default();
            if info.is_usb2() && info.is_active() && self.start_port(port) {
                started.push(port);
            }
        }

        for &port in &started {
            if let Err(err) = self.configure_port(port) {
                error!("xHCI {}: port {} configuration failed: {}", self.id, port, err);
            }
        }

        info!("xHCI controller {}: Started {} ports.", self.id, started.len());
        started.len()
    }
}
