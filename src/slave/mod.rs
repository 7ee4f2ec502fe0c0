// Licensed under the Apache-2.0 license

//! Responder side of the host processor interface: bus transport, register
//! space, event queues, dispatcher, and the protocol context tying them
//! together.

pub mod bus;
pub mod caps;
pub mod context;
pub mod dispatch;
pub mod queue;
pub mod regs;

pub use bus::{BusEvent, BusNotification, BusState, SlaveBus, SlavePhy};
pub use caps::{FwImage, HpiApplication, PdControl, PortId};
pub use context::{HpiSlave, EVENT_QUEUE_CAPACITY};
pub use queue::{EventQueue, EventRecord};
pub use regs::{DeviceRegs, PortRegs, RegisterSpace};

use fugit::MillisDurationU32;

use crate::wire::{
    BusSpeed, HpiError, MAX_PORTS, MIN_INTR_PULSE_MS, RESPONDER_ADDR_DEFAULT, RESPONDER_ADDR_MASK,
    TRANSFER_TIMEOUT_MS,
};

/// Responder interface configuration.
#[derive(Debug, Clone, Copy)]
pub struct SlaveConfig {
    /// Bus address the peripheral answers to.
    pub address: u8,
    /// Mask applied when matching the address.
    pub address_mask: u8,
    /// Bus clock class.
    pub speed: BusSpeed,
    /// Number of PD ports exposed (0 to [`MAX_PORTS`]).
    pub port_count: u8,
    /// Stalled-transfer timeout.
    pub timeout: MillisDurationU32,
    /// Minimum notification-line assertion width.
    pub min_intr_pulse: MillisDurationU32,
}

/// Builder for [`SlaveConfig`], validated at `build`.
#[derive(Debug, Clone, Copy)]
pub struct SlaveConfigBuilder {
    config: SlaveConfig,
}

impl Default for SlaveConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SlaveConfig {
                address: RESPONDER_ADDR_DEFAULT,
                address_mask: RESPONDER_ADDR_MASK,
                speed: BusSpeed::Fast,
                port_count: 1,
                timeout: MillisDurationU32::millis(TRANSFER_TIMEOUT_MS),
                min_intr_pulse: MillisDurationU32::millis(MIN_INTR_PULSE_MS),
            },
        }
    }

    pub fn address(mut self, address: u8) -> Self {
        self.config.address = address;
        self
    }

    pub fn address_mask(mut self, mask: u8) -> Self {
        self.config.address_mask = mask;
        self
    }

    pub fn speed(mut self, speed: BusSpeed) -> Self {
        self.config.speed = speed;
        self
    }

    pub fn port_count(mut self, count: u8) -> Self {
        self.config.port_count = count;
        self
    }

    pub fn timeout(mut self, timeout: MillisDurationU32) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn min_intr_pulse(mut self, width: MillisDurationU32) -> Self {
        self.config.min_intr_pulse = width;
        self
    }

    pub fn build(self) -> Result<SlaveConfig, HpiError> {
        let c = self.config;
        if c.address == 0 || c.address > 0x7F {
            return Err(HpiError::InvalidArgs);
        }
        if c.port_count as usize > MAX_PORTS {
            return Err(HpiError::InvalidArgs);
        }
        if c.timeout.ticks() == 0 {
            return Err(HpiError::InvalidArgs);
        }
        Ok(c)
    }
}
