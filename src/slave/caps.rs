// Licensed under the Apache-2.0 license

//! Application capability surface.
//!
//! The dispatcher reaches every external collaborator (flash, firmware
//! management, PD stack, alternate-mode handling) through one trait with a
//! method per capability. Every method has a default body, so an application
//! implements only what its build supports; commands landing on an
//! unimplemented capability resolve to [`HpiError::NotSupported`] instead of
//! an undefined call.

use crate::wire::{HpiError, Section};

/// Firmware image slot addressed by validate/version operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwImage {
    Image1 = 1,
    Image2 = 2,
}

impl FwImage {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(FwImage::Image1),
            2 => Some(FwImage::Image2),
            _ => None,
        }
    }
}

/// PD port addressed by port-scoped commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortId {
    Port0 = 0,
    Port1 = 1,
}

impl PortId {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(PortId::Port0),
            1 => Some(PortId::Port1),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Opcodes accepted by the PD control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdControl {
    DataRoleSwap = 0,
    PowerRoleSwap = 1,
    VconnOn = 2,
    VconnOff = 3,
    VconnSwap = 4,
    HardReset = 5,
    SoftReset = 6,
    EcInitComplete = 7,
}

impl PdControl {
    pub fn from_opcode(op: u8) -> Option<Self> {
        match op {
            0 => Some(PdControl::DataRoleSwap),
            1 => Some(PdControl::PowerRoleSwap),
            2 => Some(PdControl::VconnOn),
            3 => Some(PdControl::VconnOff),
            4 => Some(PdControl::VconnSwap),
            5 => Some(PdControl::HardReset),
            6 => Some(PdControl::SoftReset),
            7 => Some(PdControl::EcInitComplete),
            _ => None,
        }
    }
}

/// Collaborator capabilities consumed by the protocol dispatcher.
///
/// Command-backed methods return `Result`; notification methods are
/// infallible no-ops by default. Long-running outcomes are reported later
/// through the event queue, not by blocking in these calls.
pub trait HpiApplication {
    /// Mode byte exposed in the device-mode register.
    fn device_mode(&self) -> u8 {
        0
    }

    /// Version blob for one firmware image.
    fn firmware_version(&self, _image: FwImage) -> [u8; 8] {
        [0; 8]
    }

    /// Last flash row occupied by the bootloader.
    fn bootloader_last_row(&self) -> u16 {
        0
    }

    /// Full device reset. Does not return an error on success because the
    /// device is expected to go down.
    fn device_reset(&mut self) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn jump_to_bootloader(&mut self) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn jump_to_alt_firmware(&mut self) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    /// Enter (`true`) or leave (`false`) flashing mode.
    fn flash_mode_ctrl(&mut self, _enter: bool) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn flash_row_read(&mut self, _row: u16, _buf: &mut [u8]) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn flash_row_write(&mut self, _row: u16, _data: &[u8]) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn validate_firmware(&mut self, _image: FwImage) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn port_enable(&mut self, _port: PortId) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    /// Called from the foreground task, never from dispatch validation;
    /// stopping a port may take longer than a bus transaction allows.
    fn port_disable(&mut self, _port: PortId) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn pd_control(&mut self, _port: PortId, _ctrl: PdControl) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    /// New source (`src == true`) or sink PDO selection mask.
    fn select_pdo(&mut self, _port: PortId, _src: bool, _mask: u8) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn send_vdm(&mut self, _port: PortId, _data: &[u8]) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn alt_mode_command(&mut self, _port: PortId, _cmd: &[u8]) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    fn hardware_command(&mut self, _port: PortId, _cmd: &[u8]) -> Result<(), HpiError> {
        Err(HpiError::NotSupported)
    }

    /// Host rewired the event reporting mask.
    fn event_mask_updated(&mut self, _port: PortId, _mask: u32) {}

    /// Host changed the swap-response policy byte.
    fn swap_response_updated(&mut self, _port: PortId, _response: u8) {}

    /// Host allowed (`true`) or forbade deep sleep.
    fn sleep_ctrl(&mut self, _allow: bool) {}

    /// Host reported a system power-state change.
    fn power_state_changed(&mut self, _state: u8) {}

    /// Write into the user-defined window. Always forwarded, regardless of
    /// build configuration; the default accepts and ignores the data.
    fn userdef_write(&mut self, _section: Section, _offset: u8, _data: &[u8]) -> Result<(), HpiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;
    impl HpiApplication for Bare {}

    #[test]
    fn defaults_resolve_to_not_supported() {
        let mut app = Bare;
        assert_eq!(app.device_reset(), Err(HpiError::NotSupported));
        assert_eq!(app.flash_row_write(0, &[]), Err(HpiError::NotSupported));
        assert_eq!(
            app.pd_control(PortId::Port0, PdControl::HardReset),
            Err(HpiError::NotSupported)
        );
    }

    #[test]
    fn userdef_writes_accepted_by_default() {
        let mut app = Bare;
        assert!(app.userdef_write(Section::Device, 0x40, &[1, 2, 3]).is_ok());
    }

    #[test]
    fn opcode_decoding() {
        assert_eq!(PdControl::from_opcode(1), Some(PdControl::PowerRoleSwap));
        assert_eq!(PdControl::from_opcode(0xFF), None);
        assert_eq!(FwImage::from_id(2), Some(FwImage::Image2));
        assert_eq!(FwImage::from_id(0), None);
        assert_eq!(PortId::from_index(1), Some(PortId::Port1));
        assert_eq!(PortId::from_index(2), None);
    }
}
