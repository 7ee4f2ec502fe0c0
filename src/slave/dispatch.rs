// Licensed under the Apache-2.0 license

//! Protocol Dispatcher.
//!
//! Interprets a completed write transfer: either a plain register update or
//! a command. Runs only from the foreground task. Validation order: section
//! mapped, register mapped and writable, then command-specific parameters.
//! Synchronous outcomes are returned as a [`WriteAction`]; long-running work
//! is handed back to the task loop instead of being executed here.

use crate::slave::caps::{FwImage, HpiApplication, PdControl, PortId};
use crate::slave::regs::RegisterSpace;
use crate::wire::{
    HpiError, RegAddr, Region, ResponseCode, Section, USERDEF_BASE, USERDEF_LEN, WRITE_DATA_LEN,
};

/// Command signature bytes, a guard against stray register writes.
pub const SIG_JUMP_TO_BOOT: u8 = b'J';
pub const SIG_JUMP_TO_ALT_FW: u8 = b'A';
pub const SIG_RESET: u8 = b'R';
pub const SIG_ENTER_FLASH_MODE: u8 = b'P';
pub const SIG_FLASH_READ_WRITE: u8 = b'F';

/// Dispatcher state that survives between writes.
#[derive(Debug, Default)]
pub struct DispatchState {
    /// Flashing mode gate for block read/write commands.
    pub flash_mode: bool,
    /// Ports currently enabled, one bit per port.
    pub port_enabled: u8,
}

/// Follow-up the task loop must perform after a dispatched write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Data-region write stored; no response is generated.
    Stored,
    /// Load this code into the section's response registers and notify.
    Response(ResponseCode),
    /// Host acknowledged interrupt-status bits; clear them and advance the
    /// event pipeline.
    IntrClear(u8),
    /// Respond, then reset the bus interface.
    ResetInterface,
    /// Respond success now; stop these ports from the task loop.
    PortStop(u8),
}

fn byte(data: &[u8], i: usize) -> Result<u8, HpiError> {
    data.get(i).copied().ok_or(HpiError::InvalidArgs)
}

fn exact_len(data: &[u8], len: usize) -> Result<(), HpiError> {
    if data.len() == len {
        Ok(())
    } else {
        Err(HpiError::InvalidArgs)
    }
}

/// Runs one completed write through validation and command execution.
pub fn dispatch_write<A: HpiApplication>(
    regs: &mut RegisterSpace,
    state: &mut DispatchState,
    app: &mut A,
    addr: RegAddr,
    data: &[u8],
) -> Result<WriteAction, HpiError> {
    if !regs.has_section(addr.section) {
        return Err(HpiError::BadParameter);
    }
    if data.is_empty() {
        return Err(HpiError::InvalidArgs);
    }
    match addr.region {
        Region::Regs => match addr.section {
            Section::Device => device_write(regs, state, app, addr.offset, data),
            Section::Port0 | Section::Port1 => {
                let idx = usize::from(addr.section == Section::Port1);
                port_write(regs, app, idx, addr.offset, data)
            }
            Section::Extended => Err(HpiError::BadParameter),
        },
        Region::WriteData => {
            let idx = match addr.section {
                Section::Port0 => 0,
                Section::Port1 => 1,
                _ => return Err(HpiError::BadParameter),
            };
            stage_write_data(regs, idx, addr.offset, data)
        }
        Region::FlashRow => {
            if addr.section != Section::Device {
                return Err(HpiError::BadParameter);
            }
            let start = addr.offset as usize;
            let row = regs.flash_row_mut();
            let dst = start
                .checked_add(data.len())
                .and_then(|end| row.get_mut(start..end))
                .ok_or(HpiError::BadParameter)?;
            dst.copy_from_slice(data);
            Ok(WriteAction::Stored)
        }
        Region::ReadData => Err(HpiError::BadParameter),
    }
}

fn stage_write_data(
    regs: &mut RegisterSpace,
    port: usize,
    offset: u8,
    data: &[u8],
) -> Result<WriteAction, HpiError> {
    let start = offset as usize;
    let window = regs.write_data_mut(port).ok_or(HpiError::BadParameter)?;
    let dst = start
        .checked_add(data.len())
        .and_then(|end| window.get_mut(start..end))
        .ok_or(HpiError::BadParameter)?;
    dst.copy_from_slice(data);
    Ok(WriteAction::Stored)
}

fn device_write<A: HpiApplication>(
    regs: &mut RegisterSpace,
    state: &mut DispatchState,
    app: &mut A,
    offset: u8,
    data: &[u8],
) -> Result<WriteAction, HpiError> {
    match offset {
        0x03 => {
            exact_len(data, 1)?;
            Ok(WriteAction::IntrClear(byte(data, 0)?))
        }
        0x04 => {
            exact_len(data, 1)?;
            match byte(data, 0)? {
                SIG_JUMP_TO_BOOT => app.jump_to_bootloader()?,
                SIG_JUMP_TO_ALT_FW => app.jump_to_alt_firmware()?,
                _ => return Err(HpiError::InvalidArgs),
            }
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x05 => {
            exact_len(data, 2)?;
            if byte(data, 0)? != SIG_RESET {
                return Err(HpiError::InvalidArgs);
            }
            match byte(data, 1)? {
                0 => Ok(WriteAction::ResetInterface),
                1 => {
                    app.device_reset()?;
                    Ok(WriteAction::Response(ResponseCode::Success))
                }
                _ => Err(HpiError::InvalidArgs),
            }
        }
        0x07 => {
            exact_len(data, 1)?;
            let enter = match byte(data, 0)? {
                SIG_ENTER_FLASH_MODE => true,
                0 => false,
                _ => return Err(HpiError::InvalidArgs),
            };
            app.flash_mode_ctrl(enter)?;
            state.flash_mode = enter;
            regs.device_mut().enter_flash_mode = u8::from(enter);
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x08 => {
            exact_len(data, 1)?;
            let image = FwImage::from_id(byte(data, 0)?).ok_or(HpiError::InvalidArgs)?;
            match app.validate_firmware(image) {
                Ok(()) => Ok(WriteAction::Response(ResponseCode::Success)),
                Err(HpiError::CommandFailed) => {
                    Ok(WriteAction::Response(ResponseCode::InvalidFirmware))
                }
                Err(e) => Err(e),
            }
        }
        0x09 => {
            exact_len(data, 4)?;
            if byte(data, 0)? != SIG_FLASH_READ_WRITE {
                return Err(HpiError::InvalidArgs);
            }
            if !state.flash_mode {
                return Ok(WriteAction::Response(ResponseCode::FlashUpdateFailed));
            }
            let row = u16::from_le_bytes([byte(data, 2)?, byte(data, 3)?]);
            match byte(data, 1)? {
                0 => match app.flash_row_read(row, regs.flash_row_mut()) {
                    Ok(()) => Ok(WriteAction::Response(ResponseCode::FlashDataAvailable)),
                    Err(HpiError::CommandFailed) => {
                        Ok(WriteAction::Response(ResponseCode::FlashUpdateFailed))
                    }
                    Err(e) => Err(e),
                },
                1 => match app.flash_row_write(row, regs.flash_row()) {
                    Ok(()) => Ok(WriteAction::Response(ResponseCode::Success)),
                    Err(HpiError::CommandFailed) => {
                        Ok(WriteAction::Response(ResponseCode::FlashUpdateFailed))
                    }
                    Err(e) => Err(e),
                },
                _ => Err(HpiError::InvalidArgs),
            }
        }
        0x0D => {
            exact_len(data, 1)?;
            let all = (1u8 << regs.port_count()) - 1;
            let mask = if byte(data, 0)? != 0 { all } else { 0 };
            apply_port_mask(regs, state, app, mask)
        }
        0x28 => {
            exact_len(data, 1)?;
            let all = (1u8 << regs.port_count()) - 1;
            let mask = byte(data, 0)? & all;
            apply_port_mask(regs, state, app, mask)
        }
        0x29 => {
            exact_len(data, 1)?;
            let allow = byte(data, 0)? != 0;
            app.sleep_ctrl(allow);
            regs.device_mut().sleep_ctrl = u8::from(allow);
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x2A => {
            exact_len(data, 1)?;
            let power_state = byte(data, 0)?;
            app.power_state_changed(power_state);
            regs.device_mut().power_state = power_state;
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        _ => userdef_write(regs, app, Section::Device, offset, data),
    }
}

fn apply_port_mask<A: HpiApplication>(
    regs: &mut RegisterSpace,
    state: &mut DispatchState,
    app: &mut A,
    mask: u8,
) -> Result<WriteAction, HpiError> {
    let mut stop_mask = 0u8;
    for idx in 0..regs.port_count() as usize {
        let bit = 1u8 << idx;
        let port = PortId::from_index(idx).ok_or(HpiError::Undefined)?;
        if mask & bit != 0 && state.port_enabled & bit == 0 {
            app.port_enable(port)?;
            state.port_enabled |= bit;
        } else if mask & bit == 0 && state.port_enabled & bit != 0 {
            stop_mask |= bit;
        }
    }
    regs.device_mut().port_enable = mask;
    if stop_mask != 0 {
        Ok(WriteAction::PortStop(stop_mask))
    } else {
        Ok(WriteAction::Response(ResponseCode::Success))
    }
}

fn port_write<A: HpiApplication>(
    regs: &mut RegisterSpace,
    app: &mut A,
    idx: usize,
    offset: u8,
    data: &[u8],
) -> Result<WriteAction, HpiError> {
    let port = PortId::from_index(idx).ok_or(HpiError::BadParameter)?;
    match offset {
        0x00 => {
            exact_len(data, 2)?;
            let len = byte(data, 0)? as usize;
            if len > WRITE_DATA_LEN {
                return Err(HpiError::InvalidArgs);
            }
            regs.write_image(Section::for_port(idx).ok_or(HpiError::Undefined)?, offset, data)?;
            let window = regs.write_data(idx).ok_or(HpiError::Undefined)?;
            let payload = window.get(..len).ok_or(HpiError::InvalidArgs)?;
            match app.send_vdm(port, payload) {
                Ok(()) => Ok(WriteAction::Response(ResponseCode::Success)),
                Err(HpiError::CommandFailed) => {
                    Ok(WriteAction::Response(ResponseCode::PdTransactionFailed))
                }
                Err(e) => Err(e),
            }
        }
        0x08 | 0x09 => {
            exact_len(data, 1)?;
            let src = offset == 0x08;
            let mask = byte(data, 0)?;
            app.select_pdo(port, src, mask)?;
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            regs.write_image(section, offset, data)?;
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x0A => {
            exact_len(data, 1)?;
            let ctrl = PdControl::from_opcode(byte(data, 0)?).ok_or(HpiError::InvalidArgs)?;
            match app.pd_control(port, ctrl) {
                Ok(()) => Ok(WriteAction::Response(ResponseCode::Success)),
                Err(HpiError::CommandFailed) => {
                    Ok(WriteAction::Response(ResponseCode::PdCommandFailed))
                }
                Err(e) => Err(e),
            }
        }
        0x1C => {
            if data.len() > 4 {
                return Err(HpiError::InvalidArgs);
            }
            app.alt_mode_command(port, data)?;
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            regs.write_image(section, offset, data)?;
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x20 => {
            if data.len() > 4 {
                return Err(HpiError::InvalidArgs);
            }
            app.hardware_command(port, data)?;
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            regs.write_image(section, offset, data)?;
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x28 => {
            exact_len(data, 4)?;
            let mask = u32::from_le_bytes([
                byte(data, 0)?,
                byte(data, 1)?,
                byte(data, 2)?,
                byte(data, 3)?,
            ]);
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            regs.write_image(section, offset, data)?;
            app.event_mask_updated(port, mask);
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        0x2C => {
            exact_len(data, 1)?;
            let response = byte(data, 0)?;
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            regs.write_image(section, offset, data)?;
            app.swap_response_updated(port, response);
            Ok(WriteAction::Response(ResponseCode::Success))
        }
        _ => {
            let section = Section::for_port(idx).ok_or(HpiError::Undefined)?;
            userdef_write(regs, app, section, offset, data)
        }
    }
}

/// The user-defined window is the one generic extension point: writes inside
/// it are stored and forwarded verbatim, everything else is unmapped or
/// read-only.
fn userdef_write<A: HpiApplication>(
    regs: &mut RegisterSpace,
    app: &mut A,
    section: Section,
    offset: u8,
    data: &[u8],
) -> Result<WriteAction, HpiError> {
    let start = offset as usize;
    let end = start.checked_add(data.len()).ok_or(HpiError::BadParameter)?;
    let window_start = USERDEF_BASE as usize;
    let window_end = window_start + USERDEF_LEN;
    if start < window_start || end > window_end {
        return Err(HpiError::BadParameter);
    }
    regs.write_image(section, offset, data)?;
    app.userdef_write(section, offset, data)?;
    Ok(WriteAction::Response(ResponseCode::Success))
}
