// Licensed under the Apache-2.0 license

//! Register Space: the wire-visible register mirror.
//!
//! Each section is a typed 128-byte image whose in-memory layout is exactly
//! the layout the host sees, enforced with zerocopy wire integers
//! (little-endian). The mirror is owned by the protocol context and mutated
//! only by the dispatcher (host writes) and the event-drain path (status and
//! response fields).

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::wire::{
    HpiError, RegAddr, Region, Section, FLASH_ROW_SIZE, MAX_PORTS, READ_DATA_LEN, SECTION_COUNT,
    SECTION_SIZE, WRITE_DATA_LEN,
};

/// Device-wide register section.
///
/// Field order is the wire layout; reserved blocks keep later registers at
/// their published offsets.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DeviceRegs {
    /// 0x00: firmware mode currently running.
    pub device_mode: u8,
    /// 0x01: last flash row occupied by the bootloader.
    pub bootloader_last_row: U16,
    /// 0x03: per-section interrupt status (bit 0 device, 1 port 0, 2 port 1).
    pub intr_status: u8,
    /// 0x04: jump-to-boot command register.
    pub jump_to_boot: u8,
    /// 0x05: reset command register (signature, command).
    pub reset: [u8; 2],
    /// 0x07: enter-flashing-mode command register.
    pub enter_flash_mode: u8,
    /// 0x08: validate-firmware command register.
    pub validate_fw: u8,
    /// 0x09: flash read/write command (signature, command, row LSB, row MSB).
    pub flash_read_write: [u8; 4],
    /// 0x0D: enable/disable all ports at once.
    pub all_ports_enable: u8,
    _reserved0: [u8; 2],
    /// 0x10: firmware image 1 version.
    pub fw1_version: [u8; 8],
    /// 0x18: firmware image 2 version.
    pub fw2_version: [u8; 8],
    _reserved1: [u8; 8],
    /// 0x28: per-port enable bitmask.
    pub port_enable: u8,
    /// 0x29: deep-sleep permission control.
    pub sleep_ctrl: u8,
    /// 0x2A: system power state reported by the host.
    pub power_state: u8,
    _reserved2: [u8; 21],
    /// 0x40: user-defined window, always forwarded to the application.
    pub userdef: [u8; 16],
    _reserved3: [u8; 46],
    /// 0x7E: response/event code.
    pub response: u8,
    /// 0x7F: response payload length.
    pub response_len: u8,
}

/// Per-port register section.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PortRegs {
    /// 0x00: VDM control (payload length, reserved).
    pub vdm_ctrl: [u8; 2],
    _reserved0: [u8; 4],
    /// 0x06: PDOs currently offered by the source (read-only).
    pub effective_src_pdo_mask: u8,
    /// 0x07: PDOs currently offered by the sink (read-only).
    pub effective_sink_pdo_mask: u8,
    /// 0x08: source PDO selection mask.
    pub select_src_pdo: u8,
    /// 0x09: sink PDO selection mask.
    pub select_sink_pdo: u8,
    /// 0x0A: PD control command register.
    pub pd_ctrl: u8,
    _reserved1: u8,
    /// 0x0C: PD status word (read-only).
    pub pd_status: U32,
    /// 0x10: Type-C status (read-only).
    pub typec_status: u8,
    _reserved2: [u8; 3],
    /// 0x14: active power contract PDO (read-only).
    pub current_pdo: U32,
    /// 0x18: active request data object (read-only).
    pub current_rdo: U32,
    /// 0x1C: alternate-mode command register.
    pub alt_mode_cmd: [u8; 4],
    /// 0x20: hardware-control command register.
    pub hw_ctrl_cmd: [u8; 4],
    _reserved3: [u8; 4],
    /// 0x28: event reporting mask.
    pub event_mask: U32,
    /// 0x2C: swap-request response policy.
    pub swap_response: u8,
    _reserved4: [u8; 19],
    /// 0x40: user-defined window, always forwarded to the application.
    pub userdef: [u8; 16],
    _reserved5: [u8; 46],
    /// 0x7E: response/event code.
    pub response: u8,
    /// 0x7F: response payload length.
    pub response_len: u8,
}

/// The full register mirror plus its data regions.
pub struct RegisterSpace {
    device: DeviceRegs,
    ports: [PortRegs; MAX_PORTS],
    port_count: u8,
    read_data: [[u8; READ_DATA_LEN]; SECTION_COUNT],
    write_data: [[u8; WRITE_DATA_LEN]; MAX_PORTS],
    flash_row: [u8; FLASH_ROW_SIZE],
}

impl RegisterSpace {
    pub fn new(port_count: u8) -> Self {
        Self {
            device: DeviceRegs::new_zeroed(),
            ports: [PortRegs::new_zeroed(), PortRegs::new_zeroed()],
            port_count: port_count.min(MAX_PORTS as u8),
            read_data: [[0; READ_DATA_LEN]; SECTION_COUNT],
            write_data: [[0; WRITE_DATA_LEN]; MAX_PORTS],
            flash_row: [0; FLASH_ROW_SIZE],
        }
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Whether this section carries a register image on this device.
    pub fn has_section(&self, section: Section) -> bool {
        match section {
            Section::Device => true,
            Section::Port0 => self.port_count >= 1,
            Section::Port1 => self.port_count >= 2,
            Section::Extended => false,
        }
    }

    pub fn device(&self) -> &DeviceRegs {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceRegs {
        &mut self.device
    }

    pub fn port(&self, port: usize) -> Option<&PortRegs> {
        if port < self.port_count as usize {
            self.ports.get(port)
        } else {
            None
        }
    }

    pub fn port_mut(&mut self, port: usize) -> Option<&mut PortRegs> {
        if port < self.port_count as usize {
            self.ports.get_mut(port)
        } else {
            None
        }
    }

    fn section_image(&self, section: Section) -> Option<&[u8]> {
        match section {
            Section::Device => Some(self.device.as_bytes()),
            Section::Port0 => self.port(0).map(|p| p.as_bytes()),
            Section::Port1 => self.port(1).map(|p| p.as_bytes()),
            Section::Extended => None,
        }
    }

    fn section_image_mut(&mut self, section: Section) -> Option<&mut [u8]> {
        match section {
            Section::Device => Some(self.device.as_mut_bytes()),
            Section::Port0 if self.port_count >= 1 => {
                self.ports.get_mut(0).map(|p| p.as_mut_bytes())
            }
            Section::Port1 if self.port_count >= 2 => {
                self.ports.get_mut(1).map(|p| p.as_mut_bytes())
            }
            _ => None,
        }
    }

    /// Serves a host read: copies mirror contents starting at `addr` into
    /// `out`, returning the number of bytes provided. Reads have no side
    /// effects on the mirror.
    pub fn read_bytes(&self, addr: RegAddr, out: &mut [u8]) -> usize {
        let offset = addr.offset as usize;
        let src: &[u8] = match addr.region {
            Region::Regs => match self.section_image(addr.section) {
                Some(image) => image,
                None => return 0,
            },
            Region::ReadData => match addr.section.index().and_then(|i| self.read_data.get(i)) {
                Some(window) => window.as_slice(),
                None => return 0,
            },
            Region::FlashRow if addr.section == Section::Device => self.flash_row.as_slice(),
            Region::FlashRow | Region::WriteData => return 0,
        };
        let avail = src.get(offset..).unwrap_or(&[]);
        let n = avail.len().min(out.len());
        if let (Some(dst), Some(src)) = (out.get_mut(..n), avail.get(..n)) {
            dst.copy_from_slice(src);
        }
        n
    }

    /// Stores bytes verbatim into a section image. The dispatcher calls this
    /// after validation; bounds are re-checked here so a bad offset can never
    /// corrupt a neighbouring section.
    pub fn write_image(
        &mut self,
        section: Section,
        offset: u8,
        data: &[u8],
    ) -> Result<(), HpiError> {
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&e| e <= SECTION_SIZE)
            .ok_or(HpiError::BadParameter)?;
        let image = self
            .section_image_mut(section)
            .ok_or(HpiError::BadParameter)?;
        let dst = image.get_mut(start..end).ok_or(HpiError::BadParameter)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Loads a section's response-code and response-length registers.
    pub fn set_response(&mut self, section: Section, code: u8, len: u8) -> Result<(), HpiError> {
        match section {
            Section::Device => {
                self.device.response = code;
                self.device.response_len = len;
                Ok(())
            }
            Section::Port0 | Section::Port1 => {
                let idx = usize::from(section == Section::Port1);
                let port = self.port_mut(idx).ok_or(HpiError::BadParameter)?;
                port.response = code;
                port.response_len = len;
                Ok(())
            }
            Section::Extended => Err(HpiError::BadParameter),
        }
    }

    /// Current response-code register of a section, if the section exists.
    pub fn response(&self, section: Section) -> Option<(u8, u8)> {
        match section {
            Section::Device => Some((self.device.response, self.device.response_len)),
            Section::Port0 | Section::Port1 => {
                let idx = usize::from(section == Section::Port1);
                self.port(idx).map(|p| (p.response, p.response_len))
            }
            Section::Extended => None,
        }
    }

    pub fn set_intr(&mut self, mask: u8) {
        self.device.intr_status |= mask;
    }

    pub fn clear_intr(&mut self, mask: u8) {
        self.device.intr_status &= !mask;
    }

    pub fn intr_status(&self) -> u8 {
        self.device.intr_status
    }

    pub fn read_data_mut(&mut self, section: Section) -> Option<&mut [u8; READ_DATA_LEN]> {
        section.index().and_then(|i| self.read_data.get_mut(i))
    }

    pub fn write_data(&self, port: usize) -> Option<&[u8; WRITE_DATA_LEN]> {
        if port < self.port_count as usize {
            self.write_data.get(port)
        } else {
            None
        }
    }

    pub fn write_data_mut(&mut self, port: usize) -> Option<&mut [u8; WRITE_DATA_LEN]> {
        if port < self.port_count as usize {
            self.write_data.get_mut(port)
        } else {
            None
        }
    }

    pub fn flash_row(&self) -> &[u8; FLASH_ROW_SIZE] {
        &self.flash_row
    }

    pub fn flash_row_mut(&mut self) -> &mut [u8; FLASH_ROW_SIZE] {
        &mut self.flash_row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RESPONSE_OFFSET;

    #[test]
    fn section_images_are_exactly_one_section() {
        assert_eq!(core::mem::size_of::<DeviceRegs>(), SECTION_SIZE);
        assert_eq!(core::mem::size_of::<PortRegs>(), SECTION_SIZE);
    }

    #[test]
    fn device_fields_sit_at_published_offsets() {
        let mut regs = RegisterSpace::new(2);
        let dev = regs.device_mut();
        dev.device_mode = 0x01;
        dev.bootloader_last_row = U16::new(0x1234);
        dev.intr_status = 0x05;
        dev.fw1_version = *b"1.0.0.0\0";
        dev.response = 0xAA;
        dev.response_len = 0x10;

        let bytes = regs.device().as_bytes();
        assert_eq!(bytes[0x00], 0x01);
        assert_eq!(&bytes[0x01..0x03], &[0x34, 0x12]); // little-endian
        assert_eq!(bytes[0x03], 0x05);
        assert_eq!(&bytes[0x10..0x18], b"1.0.0.0\0");
        assert_eq!(bytes[0x7E], 0xAA);
        assert_eq!(bytes[0x7F], 0x10);
    }

    #[test]
    fn port_fields_sit_at_published_offsets() {
        let mut regs = RegisterSpace::new(1);
        let port = regs.port_mut(0).unwrap();
        port.pd_status = U32::new(0xDEADBEEF);
        port.event_mask = U32::new(0x0000_FFFF);
        port.swap_response = 0x11;

        let bytes = regs.port(0).unwrap().as_bytes();
        assert_eq!(&bytes[0x0C..0x10], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[0x28..0x2C], &[0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(bytes[0x2C], 0x11);
    }

    #[test]
    fn write_then_read_returns_written_value() {
        let mut regs = RegisterSpace::new(2);
        regs.write_image(Section::Port1, 0x40, &[0xDE, 0xAD]).unwrap();

        let mut out = [0u8; 2];
        let n = regs.read_bytes(RegAddr::reg(Section::Port1, 0x40), &mut out);
        assert_eq!(n, 2);
        assert_eq!(out, [0xDE, 0xAD]);
    }

    #[test]
    fn write_past_section_end_is_rejected_and_harmless() {
        let mut regs = RegisterSpace::new(2);
        let err = regs.write_image(Section::Device, 0x7F, &[1, 2]).unwrap_err();
        assert_eq!(err, HpiError::BadParameter);
        // Port 0 image (the next section in memory) must be untouched.
        assert_eq!(regs.port(0).unwrap().as_bytes(), &[0u8; SECTION_SIZE]);
    }

    #[test]
    fn absent_port_section_has_no_image() {
        let mut regs = RegisterSpace::new(1);
        assert!(regs.has_section(Section::Port0));
        assert!(!regs.has_section(Section::Port1));
        assert!(regs.write_image(Section::Port1, 0x00, &[0]).is_err());
        let mut out = [0u8; 4];
        assert_eq!(regs.read_bytes(RegAddr::reg(Section::Port1, 0), &mut out), 0);
    }

    #[test]
    fn response_registers_load_and_report() {
        let mut regs = RegisterSpace::new(2);
        regs.set_response(Section::Port0, 0x84, 4).unwrap();
        assert_eq!(regs.response(Section::Port0), Some((0x84, 4)));

        let mut out = [0u8; 2];
        regs.read_bytes(RegAddr::reg(Section::Port0, RESPONSE_OFFSET), &mut out);
        assert_eq!(out, [0x84, 4]);
    }

    #[test]
    fn flash_row_readable_from_device_section_only() {
        let mut regs = RegisterSpace::new(2);
        regs.flash_row_mut()[0] = 0x5A;
        let mut out = [0u8; 1];
        let addr = RegAddr::new(Section::Device, Region::FlashRow, 0);
        assert_eq!(regs.read_bytes(addr, &mut out), 1);
        assert_eq!(out[0], 0x5A);

        let addr = RegAddr::new(Section::Port0, Region::FlashRow, 0);
        assert_eq!(regs.read_bytes(addr, &mut out), 0);
    }
}
