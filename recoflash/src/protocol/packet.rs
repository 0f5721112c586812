//! Recovery bootloader command packets.
//!
//! Every packet in either direction is a CRC32-prefixed message, exchanged
//! over SLIP framing:
//!
//! ```text
//! Request:
//! +-----------+----------+---------+-------------------+
//! |  CRC32    | Sequence | Command |       Body        |
//! +-----------+----------+---------+-------------------+
//! |  4 bytes  | 1 byte   | 1 byte  |     variable      |
//! +-----------+----------+---------+-------------------+
//!
//! Response:
//! +-----------+----------+----------+--------+---------+
//! |  CRC32    | Sequence | Reserved | Result | Payload |
//! +-----------+----------+----------+--------+---------+
//! |  4 bytes  | 1 byte   | 2 bytes  | 1 byte | variable|
//! +-----------+----------+----------+--------+---------+
//! ```
//!
//! The CRC32 (zlib polynomial, little-endian) covers everything after
//! itself. A failed CRC is a transport problem, not a protocol one: the
//! transaction layer retransmits instead of giving up.

use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Byte offset of the result code in a response.
const RESPONSE_RESULT_OFFSET: usize = 7;

/// Minimum length of a response: CRC + sequence + reserved + result.
const RESPONSE_HEADER_LEN: usize = 8;

/// Byte offset of the data in a read response, past the echoed
/// address/length pair.
const RESPONSE_READ_DATA_OFFSET: usize = 16;

/// Recovery bootloader command ids.
///
/// The discriminants are the wire protocol; they must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Response message id, never sent as a request (0).
    Response = 0,
    /// Write data to flash (1).
    DataWrite = 1,
    /// Read data from flash (2).
    DataRead = 2,
    /// Erase one flash page (3).
    PageErase = 3,
    /// Compute the CRC of a flash area (4).
    CrcCheck = 4,
    /// Reset the device (5).
    Reset = 5,
    /// Write data to UICR registers (6).
    UicrWrite = 6,
    /// Erase the UICR page (7).
    UicrErase = 7,
    /// Read data from UICR (8).
    UicrRead = 8,
    /// Request protocol and firmware version (9).
    VersionGet = 9,
    /// Request flash and UICR geometry (10).
    DeviceInfoGet = 10,
    /// Erase all available flash and UICR (11).
    EraseAll = 11,
}

/// Result codes carried in the response header.
///
/// The discriminants are the wire protocol; they must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckReason {
    /// Command executed properly.
    Ack = 0,
    /// Received packet CRC is invalid; the device asks for retransmission.
    NackInvalidCrc = 1,
    /// Requested command is not supported.
    NackInvalidCmd = 2,
    /// Message is longer than the transport MTU.
    NackInvalidMsgSize = 3,
    /// Requested address is protected against erase and write.
    NackPageProtected = 4,
    /// Write address is not erased.
    NackAddressNotErased = 5,
    /// Write data or address is not word aligned.
    NackDataNotAligned = 6,
    /// Given address exceeds the flash address space.
    NackInvalidAddress = 7,
    /// Operation is invalid while the application is protected.
    NackApprotectOn = 8,
}

impl AckReason {
    /// Decode a wire result byte. Unknown values yield `None` and are
    /// treated as frame corruption by the transaction layer.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ack),
            1 => Some(Self::NackInvalidCrc),
            2 => Some(Self::NackInvalidCmd),
            3 => Some(Self::NackInvalidMsgSize),
            4 => Some(Self::NackPageProtected),
            5 => Some(Self::NackAddressNotErased),
            6 => Some(Self::NackDataNotAligned),
            7 => Some(Self::NackInvalidAddress),
            8 => Some(Self::NackApprotectOn),
            _ => None,
        }
    }
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ack => "acknowledged",
            Self::NackInvalidCrc => "invalid packet CRC",
            Self::NackInvalidCmd => "invalid command",
            Self::NackInvalidMsgSize => "invalid message size",
            Self::NackPageProtected => "page is protected",
            Self::NackAddressNotErased => "address is not erased",
            Self::NackDataNotAligned => "data is not word aligned",
            Self::NackInvalidAddress => "invalid address",
            Self::NackApprotectOn => "application protection is on",
        };
        f.write_str(text)
    }
}

/// Pad data to a 4-byte multiple with `0xFF` (the erased-flash value).
pub(crate) fn pad_to_word(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0xFF);
    }
    padded
}

/// Request packet builder.
///
/// Carries a command and its body; the session assigns the sequence number
/// at transmission time via [`Request::encode`].
#[derive(Debug, Clone)]
pub struct Request {
    command: Command,
    body: Vec<u8>,
}

impl Request {
    fn new(command: Command) -> Self {
        Self {
            command,
            body: Vec::new(),
        }
    }

    /// Build a flash write request. The payload is padded to a word
    /// multiple before transmission.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // payloads are chunk sized
    pub fn data_write(address: u32, data: &[u8]) -> Self {
        let mut request = Self::new(Command::DataWrite);
        let data = pad_to_word(data);
        request.body.write_u32::<LittleEndian>(address).unwrap();
        request
            .body
            .write_u32::<LittleEndian>(data.len() as u32)
            .unwrap();
        request.body.extend_from_slice(&data);
        request
    }

    /// Build a flash read request.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn data_read(address: u32, length: u32) -> Self {
        let mut request = Self::new(Command::DataRead);
        request.body.write_u32::<LittleEndian>(address).unwrap();
        request.body.write_u32::<LittleEndian>(length).unwrap();
        request
    }

    /// Build a page erase request.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn page_erase(page_address: u32) -> Self {
        let mut request = Self::new(Command::PageErase);
        request
            .body
            .write_u32::<LittleEndian>(page_address)
            .unwrap();
        request
    }

    /// Build a CRC check request over a flash area.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn crc_check(address: u32, length: u32) -> Self {
        let mut request = Self::new(Command::CrcCheck);
        request.body.write_u32::<LittleEndian>(address).unwrap();
        request.body.write_u32::<LittleEndian>(length).unwrap();
        request
    }

    /// Build a device reset request.
    pub fn reset() -> Self {
        Self::new(Command::Reset)
    }

    /// Build a UICR write request. The payload is padded to a word
    /// multiple before transmission.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)] // payloads are chunk sized
    pub fn uicr_write(address: u32, data: &[u8]) -> Self {
        let mut request = Self::new(Command::UicrWrite);
        let data = pad_to_word(data);
        request.body.write_u32::<LittleEndian>(address).unwrap();
        request
            .body
            .write_u32::<LittleEndian>(data.len() as u32)
            .unwrap();
        request.body.extend_from_slice(&data);
        request
    }

    /// Build a UICR erase request.
    pub fn uicr_erase() -> Self {
        Self::new(Command::UicrErase)
    }

    /// Build a UICR read request.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn uicr_read(address: u32, length: u32) -> Self {
        let mut request = Self::new(Command::UicrRead);
        request.body.write_u32::<LittleEndian>(address).unwrap();
        request.body.write_u32::<LittleEndian>(length).unwrap();
        request
    }

    /// Build a version query request.
    pub fn version_get() -> Self {
        Self::new(Command::VersionGet)
    }

    /// Build a device info query request.
    pub fn device_info() -> Self {
        Self::new(Command::DeviceInfoGet)
    }

    /// Build a mass erase request.
    pub fn erase_all() -> Self {
        Self::new(Command::EraseAll)
    }

    /// Get the command id.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Encode the complete packet for the given sequence number.
    ///
    /// Every call builds a fresh buffer, so retransmissions of the same
    /// request are byte-identical.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self, sequence: u8) -> Vec<u8> {
        let mut message = Vec::with_capacity(2 + self.body.len());
        message.push(sequence);
        message.push(self.command as u8);
        message.extend_from_slice(&self.body);

        let mut packet = Vec::with_capacity(4 + message.len());
        packet
            .write_u32::<LittleEndian>(crc32fast::hash(&message))
            .unwrap();
        packet.extend_from_slice(&message);
        packet
    }
}

/// Frame-level corruption: bad CRC, truncated header, or a result byte
/// outside the known set. Recovered by retransmission, never surfaced to
/// callers directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCorrupt;

/// A validated response packet.
#[derive(Debug, Clone)]
pub struct Response {
    frame: Vec<u8>,
    reason: AckReason,
}

impl Response {
    /// Validate a raw de-framed packet.
    ///
    /// The CRC is checked before any content is inspected; nothing about a
    /// corrupt frame is trusted, including its result byte.
    pub fn parse(frame: &[u8]) -> Result<Self, FrameCorrupt> {
        if frame.len() < RESPONSE_HEADER_LEN {
            return Err(FrameCorrupt);
        }
        let crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if crc != crc32fast::hash(&frame[4..]) {
            return Err(FrameCorrupt);
        }
        let reason =
            AckReason::from_raw(frame[RESPONSE_RESULT_OFFSET]).ok_or(FrameCorrupt)?;
        Ok(Self {
            frame: frame.to_vec(),
            reason,
        })
    }

    /// Sequence number echoed by the device.
    pub fn sequence(&self) -> u8 {
        self.frame[4]
    }

    /// Result code of the request.
    pub fn ack_reason(&self) -> AckReason {
        self.reason
    }

    /// Command-specific result payload.
    pub fn payload(&self) -> &[u8] {
        &self.frame[RESPONSE_HEADER_LEN..]
    }

    /// Data bytes of a read response, past the echoed address and length.
    pub fn read_payload(&self) -> &[u8] {
        self.frame.get(RESPONSE_READ_DATA_OFFSET..).unwrap_or(&[])
    }

    /// First payload word, little-endian (the CRC check result).
    pub fn result_u32(&self) -> Option<u32> {
        let payload = self.payload();
        let bytes = payload.get(..4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
