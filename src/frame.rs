//! Wire codec for MyRvLink command and event frames.
//!
//! Outgoing commands are framed as `[command id: u16][command type: u8][payload]`,
//! inbound events as `[event type: u8][command id: u16][response type: u8][payload]`.
//! Multi-byte fields are big-endian.
//!
//! Also contains the block-transfer payload layouts and the chained CRC32
//! used to verify each transferred chunk.

use crate::Error;
use bitflags::bitflags;
use strum::FromRepr;

/// Sentinel command id for fire-and-forget commands.
///
/// Commands carrying this id expect no response and bypass tracking
/// entirely; the valid range for tracked commands is `1..=0xfffe`.
pub const NO_RESPONSE_COMMAND_ID: u16 = 0xffff;

/// Maximum number of data bytes in a single block-transfer chunk.
pub const MAX_CHUNK_SIZE: usize = 128;

/// Address offset marking the end of a block transfer.
pub const FINISH_OFFSET: u32 = 0xffff_ffff;

/// Command type sent to the gateway.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum CommandKind {
    /// Query gateway version and identity information.
    GetGatewayInformation = 0x01,
    /// Query the gateway's real-time clock.
    GetRealTimeClock = 0x02,
    /// Read a device parameter (PID).
    ReadParameter = 0x10,
    /// Write a device parameter (PID).
    WriteParameter = 0x11,
    /// Fetch stored diagnostic trouble codes.
    GetTroubleCodes = 0x12,
    /// Begin a block transfer to addressed device memory.
    StartBlockTransfer = 0x20,
    /// Write one chunk of block data (or the finish marker).
    WriteBlockData = 0x21,
}

/// Event type received from the gateway.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum EventKind {
    /// Gateway version and identity information.
    GatewayInformation = 0x81,
    /// Real-time clock report.
    RealTimeClock = 0x82,
    /// Generic command status echo.
    CommandStatus = 0x83,
    /// Device parameter (PID) value.
    ParameterValue = 0x90,
    /// Diagnostic trouble code report.
    TroubleCodes = 0x91,
    /// Block-transfer progress or result.
    TransferStatus = 0xa0,
}

impl EventKind {
    /// Whether this event may be processed before the minimum protocol
    /// version has been negotiated.
    #[must_use]
    pub const fn is_bootstrap(self) -> bool {
        matches!(
            self,
            Self::GatewayInformation | Self::RealTimeClock | Self::CommandStatus
        )
    }
}

/// Response code carried in the low bits of an event's response type.
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ResponseCode {
    /// The command succeeded.
    Success = 0x00,
    /// The command failed; the first payload byte carries the failure code.
    Failure = 0x01,
    /// A block-transfer chunk was accepted but not yet written.
    TransferStarted = 0x02,
    /// A block-transfer chunk was written; the payload carries the
    /// device-computed CRC32.
    TransferData = 0x03,
}

/// Response type byte of an event frame.
///
/// The high bit marks "command fully completed"; the remaining bits
/// carry a [`ResponseCode`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct ResponseType(u8);

impl ResponseType {
    const COMPLETED: u8 = 0x80;

    /// Constructs a response type from a code and completion flag.
    #[must_use]
    pub const fn new(code: ResponseCode, completed: bool) -> Self {
        Self(code as u8 | if completed { Self::COMPLETED } else { 0 })
    }

    /// Constructs a response type from its raw wire representation.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw wire representation.
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns the response code, if recognized.
    #[must_use]
    pub fn code(self) -> Option<ResponseCode> {
        ResponseCode::from_repr(self.0 & !Self::COMPLETED)
    }

    /// Whether the command is fully completed by this response.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        self.0 & Self::COMPLETED != 0
    }
}

/// An outgoing command frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct CommandFrame {
    /// Correlation id; 0 until assigned by the registry,
    /// or [`NO_RESPONSE_COMMAND_ID`] for fire-and-forget commands.
    pub id: u16,
    /// Command type.
    pub kind: CommandKind,
    /// Command payload.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Constructs a command with an unassigned id.
    ///
    /// The registry assigns a free correlation id when the command is sent.
    #[must_use]
    pub fn new(kind: CommandKind, payload: Vec<u8>) -> Self {
        Self {
            id: 0,
            kind,
            payload,
        }
    }

    /// Constructs a fire-and-forget command that expects no response.
    #[must_use]
    pub fn fire_and_forget(kind: CommandKind, payload: Vec<u8>) -> Self {
        Self {
            id: NO_RESPONSE_COMMAND_ID,
            kind,
            payload,
        }
    }

    /// Serializes the command for transmission.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len());

        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserializes a command frame.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCommand`] if the frame is truncated or carries
    ///   an unknown command type.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 3 {
            return Err(Error::InvalidCommand);
        }

        let kind = CommandKind::from_repr(buf[2]).ok_or(Error::InvalidCommand)?;

        Ok(Self {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            kind,
            payload: buf[3..].to_vec(),
        })
    }
}

/// An inbound event frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct EventFrame {
    /// Event type.
    pub kind: EventKind,
    /// Id of the command that caused this event; 0 for unsolicited events.
    pub command_id: u16,
    /// Response type, including the completion flag.
    pub response: ResponseType,
    /// Event payload.
    pub payload: Vec<u8>,
}

impl EventFrame {
    /// Constructs an event frame.
    #[must_use]
    pub fn new(
        kind: EventKind,
        command_id: u16,
        response: ResponseType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            command_id,
            response,
            payload,
        }
    }

    /// Serializes the event frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());

        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.command_id.to_be_bytes());
        buf.push(self.response.raw());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserializes an event frame.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidResponse`] if the frame is truncated or carries
    ///   an unknown event type.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 {
            return Err(Error::InvalidResponse);
        }

        let kind = EventKind::from_repr(buf[0]).ok_or(Error::InvalidResponse)?;

        Ok(Self {
            kind,
            command_id: u16::from_be_bytes([buf[1], buf[2]]),
            response: ResponseType::from_raw(buf[3]),
            payload: buf[4..].to_vec(),
        })
    }

    /// Returns the device-reported failure code if this event reports
    /// a failure.
    #[must_use]
    pub fn failure_code(&self) -> Option<u8> {
        if self.response.code() == Some(ResponseCode::Failure) {
            Some(self.payload.first().copied().unwrap_or_default())
        } else {
            None
        }
    }
}

/// Address of a logical device behind the gateway.
///
/// Devices are enumerated by the gateway's device table and identified
/// by the pair of table id and device id.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct DeviceAddress {
    /// Device table id.
    pub table: u8,
    /// Device id within the table.
    pub device: u8,
}

impl DeviceAddress {
    /// Constructs a device address.
    #[must_use]
    pub const fn new(table: u8, device: u8) -> Self {
        Self { table, device }
    }
}

bitflags! {
    /// Request flags for starting a block transfer.
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub struct TransferFlags: u8 {
        /// The transfer writes device memory.
        const WRITE = 1 << 0;
        /// The target region is erased before writing.
        const ERASE = 1 << 1;
        /// The request carries an explicit start address.
        const START_ADDRESS = 1 << 2;
        /// The request carries an explicit total size.
        const SIZE = 1 << 3;
    }
}

/// Payload of a [`CommandKind::StartBlockTransfer`] command.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct StartTransfer {
    /// Target device.
    pub target: DeviceAddress,
    /// Block id to transfer into.
    pub block: u16,
    /// Request flags.
    pub flags: TransferFlags,
    /// Start address within the block.
    pub start: u32,
    /// Total transfer size in bytes.
    pub size: u32,
}

impl StartTransfer {
    /// Serializes the start-transfer payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13);

        buf.push(self.target.table);
        buf.push(self.target.device);
        buf.extend_from_slice(&self.block.to_be_bytes());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.start.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());

        buf
    }

    /// Deserializes a start-transfer payload.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCommand`] if the payload is truncated.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 13 {
            return Err(Error::InvalidCommand);
        }

        Ok(Self {
            target: DeviceAddress::new(buf[0], buf[1]),
            block: u16::from_be_bytes([buf[2], buf[3]]),
            flags: TransferFlags::from_bits_truncate(buf[4]),
            start: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            size: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
        })
    }
}

/// Payload of a [`CommandKind::WriteBlockData`] command.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct BlockWriteData {
    /// Target device.
    pub target: DeviceAddress,
    /// Block id being written.
    pub block: u16,
    /// Address offset of this chunk within the block.
    pub offset: u32,
    /// Chunk data, at most [`MAX_CHUNK_SIZE`] bytes.
    pub data: Vec<u8>,
}

impl BlockWriteData {
    /// Constructs a block-write payload.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCommand`] if `data` exceeds [`MAX_CHUNK_SIZE`] bytes.
    pub fn new(
        target: DeviceAddress,
        block: u16,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<Self, Error> {
        if data.len() > MAX_CHUNK_SIZE {
            return Err(Error::InvalidCommand);
        }

        Ok(Self {
            target,
            block,
            offset,
            data,
        })
    }

    /// Constructs the finish marker terminating a block transfer.
    ///
    /// The marker carries the all-ones address offset and no data.
    #[must_use]
    pub fn finish_marker(target: DeviceAddress, block: u16) -> Self {
        Self {
            target,
            block,
            offset: FINISH_OFFSET,
            data: Vec::new(),
        }
    }

    /// Whether this payload is the finish marker.
    #[must_use]
    pub fn is_finish_marker(&self) -> bool {
        self.offset == FINISH_OFFSET && self.data.is_empty()
    }

    /// Serializes the block-write payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.data.len());

        buf.push(self.target.table);
        buf.push(self.target.device);
        buf.extend_from_slice(&self.block.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.push(self.data.len() as u8);
        buf.extend_from_slice(&self.data);

        buf
    }

    /// Deserializes a block-write payload.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCommand`] if the payload is truncated or its
    ///   size field disagrees with the data length.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 9 {
            return Err(Error::InvalidCommand);
        }

        let size = buf[8] as usize;

        if buf.len() != 9 + size {
            return Err(Error::InvalidCommand);
        }

        Ok(Self {
            target: DeviceAddress::new(buf[0], buf[1]),
            block: u16::from_be_bytes([buf[2], buf[3]]),
            offset: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data: buf[9..].to_vec(),
        })
    }
}

/// Computes the running CRC32 of a block-transfer chunk.
///
/// The first chunk of a transfer passes `None` and seeds the standard
/// IEEE initial state; every following chunk chains from the previous
/// chunk's final value, so the CRC after the last chunk equals the CRC
/// of the whole transferred image.
#[must_use]
pub fn chunk_crc32(prev: Option<u32>, data: &[u8]) -> u32 {
    let mut hasher = match prev {
        Some(crc) => crc32fast::Hasher::new_with_initial(crc),
        None => crc32fast::Hasher::new(),
    };

    hasher.update(data);
    hasher.finalize()
}
