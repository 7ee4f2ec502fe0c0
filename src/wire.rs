// Licensed under the Apache-2.0 license

//! Wire contract shared by the responder and initiator roles.
//!
//! A register address is 16 bits wide and travels MSB first, so the routing
//! nibbles arrive before the offset byte:
//!
//! ```text
//!   bit 15..12  section   (device / port 0 / port 1 / extended)
//!   bit 11..8   region    (registers / write-data / flash row / read-data)
//!   bit  7..0   offset    byte offset within the region
//! ```
//!
//! All multi-byte register fields and the event-record length field are
//! little-endian. Both roles use this module for encode and decode, so the
//! two sides cannot disagree on byte order.

/// Default responder bus address.
pub const RESPONDER_ADDR_DEFAULT: u8 = 0x40;
/// Address mask applied when matching the responder address.
pub const RESPONDER_ADDR_MASK: u8 = 0xFE;
/// Transfer timeout before a stalled bus transaction is abandoned.
pub const TRANSFER_TIMEOUT_MS: u32 = 500;
/// Minimum notification-line assertion width.
pub const MIN_INTR_PULSE_MS: u32 = 1;

/// Number of addressable sections carrying a register image.
pub const SECTION_COUNT: usize = 3;
/// Maximum PD ports a single responder exposes.
pub const MAX_PORTS: usize = 2;
/// Size of one section's register image in bytes.
pub const SECTION_SIZE: usize = 128;
/// Flash row granularity for block read/write commands.
pub const FLASH_ROW_SIZE: usize = 256;
/// First offset of the user-defined register window.
pub const USERDEF_BASE: u8 = 0x40;
/// Width of the user-defined register window.
pub const USERDEF_LEN: usize = 16;
/// Offset of the interrupt-status register in the device section.
pub const INTR_STATUS_OFFSET: u8 = 0x03;
/// Offset of the response-code register within every section.
pub const RESPONSE_OFFSET: u8 = 0x7E;
/// Offset of the response-length register within every section.
pub const RESPONSE_LEN_OFFSET: u8 = 0x7F;
/// Size of the per-section read-data window holding event payloads.
pub const READ_DATA_LEN: usize = 64;
/// Size of the per-port write-data staging area.
pub const WRITE_DATA_LEN: usize = 32;

/// Bus clock classes supported on the two-wire interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSpeed {
    /// Standard speed, 100 kHz
    Standard = 100_000,
    /// Fast speed, 400 kHz
    Fast = 400_000,
    /// Fast+ speed, 1 MHz
    FastPlus = 1_000_000,
}

/// Independently addressed partition of the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Section {
    /// Device-wide registers.
    Device = 0x0,
    /// Registers of PD port 0.
    Port0 = 0x1,
    /// Registers of PD port 1.
    Port1 = 0x2,
    /// Extended command section. Routed but carries no register image.
    Extended = 0xF,
}

impl Section {
    /// Decodes the section nibble of a register address.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Section::Device),
            0x1 => Some(Section::Port0),
            0x2 => Some(Section::Port1),
            0xF => Some(Section::Extended),
            _ => None,
        }
    }

    /// Index into per-section storage. `None` for the extended section.
    pub fn index(self) -> Option<usize> {
        match self {
            Section::Device => Some(0),
            Section::Port0 => Some(1),
            Section::Port1 => Some(2),
            Section::Extended => None,
        }
    }

    /// Bit this section occupies in the interrupt-status register.
    pub fn intr_mask(self) -> u8 {
        match self {
            Section::Device => 0x01,
            Section::Port0 => 0x02,
            Section::Port1 => 0x04,
            Section::Extended => 0x08,
        }
    }

    /// Section carrying the registers of the given port index.
    pub fn for_port(port: usize) -> Option<Self> {
        match port {
            0 => Some(Section::Port0),
            1 => Some(Section::Port1),
            _ => None,
        }
    }
}

/// Address region within a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Region {
    /// The register image itself.
    Regs = 0x0,
    /// Write-data staging area (command payloads such as VDM data).
    WriteData = 0x1,
    /// Flash row buffer for block read/write.
    FlashRow = 0x2,
    /// Read-data window exposing queued event payloads.
    ReadData = 0x4,
}

impl Region {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Region::Regs),
            0x1 => Some(Region::WriteData),
            0x2 => Some(Region::FlashRow),
            0x4 => Some(Region::ReadData),
            _ => None,
        }
    }
}

/// Fully decoded 16-bit register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAddr {
    pub section: Section,
    pub region: Region,
    pub offset: u8,
}

impl RegAddr {
    pub const fn new(section: Section, region: Region, offset: u8) -> Self {
        Self {
            section,
            region,
            offset,
        }
    }

    /// Shorthand for a plain register address within a section.
    pub const fn reg(section: Section, offset: u8) -> Self {
        Self::new(section, Region::Regs, offset)
    }

    /// Encodes to the two bytes sent on the wire, MSB first.
    pub fn encode(self) -> [u8; 2] {
        [((self.section as u8) << 4) | (self.region as u8), self.offset]
    }

    /// Decodes the two address bytes received on the wire.
    pub fn decode(bytes: [u8; 2]) -> Result<Self, HpiError> {
        let section = Section::from_nibble(bytes[0] >> 4).ok_or(HpiError::BadParameter)?;
        let region = Region::from_nibble(bytes[0] & 0x0F).ok_or(HpiError::BadParameter)?;
        Ok(Self {
            section,
            region,
            offset: bytes[1],
        })
    }
}

/// Protocol status taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpiError {
    /// A caller-supplied value is out of range or malformed.
    InvalidArgs,
    /// Unmapped address, read-only register, or unsupported opcode field.
    BadParameter,
    /// The capability backing a command is not implemented.
    NotSupported,
    /// Bus-level NAK, timeout, or transfer error.
    Transport,
    /// An event record did not fit in its section queue.
    QueueOverflow,
    /// A collaborator reported functional failure.
    CommandFailed,
    /// Catch-all for states that should not be reachable.
    Undefined,
}

/// Response and event codes visible in the response-code register.
///
/// Codes below 0x80 answer a host command; codes at or above 0x80 are
/// asynchronous events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    NoResponse = 0x00,
    Success = 0x02,
    FlashDataAvailable = 0x03,
    InvalidCommand = 0x05,
    CommandFailed = 0x06,
    FlashUpdateFailed = 0x07,
    InvalidFirmware = 0x08,
    InvalidArguments = 0x09,
    NotSupported = 0x0A,
    PdTransactionFailed = 0x0C,
    PdCommandFailed = 0x0D,
    UndefinedError = 0x0F,
    ResetComplete = 0x80,
    MessageOverflow = 0x81,
    OverCurrentDetected = 0x82,
    OverVoltageDetected = 0x83,
    ConnectDetected = 0x84,
    DisconnectDetected = 0x85,
    NegotiationComplete = 0x86,
    SwapComplete = 0x87,
    HardResetReceived = 0x88,
    VdmReceived = 0x90,
    SourceCapReceived = 0x91,
    SinkCapReceived = 0x92,
    PortDisabled = 0x93,
    PortEnabled = 0x94,
}

impl ResponseCode {
    /// Whether this code reports an asynchronous event.
    pub fn is_event(self) -> bool {
        (self as u8) >= 0x80
    }
}

impl From<HpiError> for ResponseCode {
    fn from(err: HpiError) -> Self {
        match err {
            HpiError::InvalidArgs => ResponseCode::InvalidArguments,
            HpiError::BadParameter => ResponseCode::InvalidCommand,
            HpiError::NotSupported => ResponseCode::NotSupported,
            HpiError::CommandFailed => ResponseCode::CommandFailed,
            HpiError::QueueOverflow => ResponseCode::MessageOverflow,
            HpiError::Transport | HpiError::Undefined => ResponseCode::UndefinedError,
        }
    }
}
