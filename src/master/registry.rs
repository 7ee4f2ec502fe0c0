// Licensed under the Apache-2.0 license

//! Registry of remote responder devices on the initiator side.
//!
//! Fixed-slot table: registration claims the first free slot and the slot
//! index is the device's handle for the rest of the session, so pending-bit
//! masks built from indexes never shift under a caller.

use crate::wire::{HpiError, MAX_PORTS};

/// Maximum responder devices one initiator context manages.
pub const MAX_SLAVES: usize = 4;

/// Identity of a notification line, as opaque to this crate as the
/// application wants it to be (port/pin packed into a byte, an EXTI number,
/// an index). The registry only compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrLine(pub u8);

/// One registered responder.
#[derive(Debug, Clone, Copy)]
pub struct SlaveDevice {
    address: u8,
    intr_line: IntrLine,
    port_count: u8,
    fail_count: u8,
}

impl SlaveDevice {
    pub fn new(address: u8, intr_line: IntrLine, port_count: u8) -> Self {
        Self {
            address,
            intr_line,
            port_count,
            fail_count: 0,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn intr_line(&self) -> IntrLine {
        self.intr_line
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Consecutive failed transactions since the last success.
    pub fn fail_count(&self) -> u8 {
        self.fail_count
    }
}

/// Slot table of registered responders.
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slots: [Option<SlaveDevice>; MAX_SLAVES],
}

impl SlaveRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_SLAVES],
        }
    }

    /// Registers a device and returns its slot index. Rejects invalid
    /// addresses, excess port counts, duplicate addresses or lines, and a
    /// full table.
    pub fn register(&mut self, dev: SlaveDevice) -> Result<u8, HpiError> {
        if dev.address == 0 || dev.address > 0x7F {
            return Err(HpiError::InvalidArgs);
        }
        if dev.port_count as usize > MAX_PORTS {
            return Err(HpiError::InvalidArgs);
        }
        let duplicate = self.iter().any(|(_, d)| {
            d.address == dev.address || d.intr_line == dev.intr_line
        });
        if duplicate {
            return Err(HpiError::InvalidArgs);
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(HpiError::InvalidArgs)?;
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(SlaveDevice {
                fail_count: 0,
                ..dev
            });
        }
        Ok(slot as u8)
    }

    /// Frees a slot. The index may be reused by a later registration.
    pub fn unregister(&mut self, index: u8) -> Result<(), HpiError> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(HpiError::InvalidArgs)?;
        if slot.take().is_none() {
            return Err(HpiError::InvalidArgs);
        }
        Ok(())
    }

    pub fn get(&self, index: u8) -> Option<&SlaveDevice> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn find_by_line(&self, line: IntrLine) -> Option<u8> {
        self.iter()
            .find(|(_, d)| d.intr_line == line)
            .map(|(i, _)| i)
    }

    pub fn find_by_address(&self, address: u8) -> Option<u8> {
        self.iter()
            .find(|(_, d)| d.address == address)
            .map(|(i, _)| i)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &SlaveDevice)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (i as u8, d)))
    }

    /// Saturating failure increment; returns the new count.
    pub fn record_failure(&mut self, index: u8) -> u8 {
        match self.slots.get_mut(index as usize).and_then(Option::as_mut) {
            Some(dev) => {
                dev.fail_count = dev.fail_count.saturating_add(1);
                dev.fail_count
            }
            None => 0,
        }
    }

    /// A successful transaction clears the failure streak.
    pub fn record_success(&mut self, index: u8) {
        if let Some(dev) = self.slots.get_mut(index as usize).and_then(Option::as_mut) {
            dev.fail_count = 0;
        }
    }
}
