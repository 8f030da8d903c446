//! Frame encoding and decoding utilities.

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::command::Command;
use crate::error::ProtocolError;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Magic constant identifying a helper-channel frame.
pub const FRAME_SIGNATURE: u32 = 0xDECA_FBAD;

/// Maximum payload size (8 MB).
pub const MAX_DATA_SIZE: usize = 8 * 1024 * 1024;

/// Frame header for helper-channel messages.
///
/// Wire format (12 bytes, big-endian):
/// - Bytes 0-3: Signature (u32, fixed magic)
/// - Bytes 4-7: Adler-32 checksum of the payload (u32)
/// - Bytes 8-11: Payload length (u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol signature.
    pub signature: u32,
    /// Adler-32 checksum over the payload bytes exactly.
    pub data_checksum: u32,
    /// Length of the payload in bytes.
    pub data_sz: u32,
}

impl FrameHeader {
    /// Creates a new frame header with the current signature.
    #[must_use]
    pub const fn new(data_checksum: u32, data_sz: u32) -> Self {
        Self {
            signature: FRAME_SIGNATURE,
            data_checksum,
            data_sz,
        }
    }

    /// Encodes the frame header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.signature.to_be_bytes());
        buf[4..8].copy_from_slice(&self.data_checksum.to_be_bytes());
        buf[8..12].copy_from_slice(&self.data_sz.to_be_bytes());
        buf
    }

    /// Decodes a frame header from bytes.
    ///
    /// Validates the signature and the payload length bound.
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let signature = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data_checksum = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data_sz = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        if signature != FRAME_SIGNATURE {
            return Err(ProtocolError::InvalidSignature(signature));
        }

        Ok(Self {
            signature,
            data_checksum,
            data_sz,
        })
    }

    /// Validates the payload length.
    pub fn validate_data_sz(&self) -> Result<(), ProtocolError> {
        let len = self.data_sz as usize;
        if len > MAX_DATA_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_DATA_SIZE,
            });
        }
        Ok(())
    }
}

/// Computes the frame checksum over a payload.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(data).hash()
}

/// Codec for encoding and decoding helper-channel frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Reusable buffer for encoding.
    buffer: Vec<u8>,
}

impl FrameCodec {
    /// Creates a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Creates a codec with pre-allocated buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encodes a command to bytes (frame header + payload).
    ///
    /// Returns the complete frame including the 12-byte header.
    pub fn encode(&mut self, command: &Command) -> Result<&[u8], ProtocolError> {
        let payload = rkyv::to_bytes::<RkyvError>(command)
            .map_err(|e| ProtocolError::Serialisation(e.to_string()))?;

        if payload.len() > MAX_DATA_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_DATA_SIZE,
            });
        }

        #[allow(clippy::as_conversions)]
        let header = FrameHeader::new(checksum(&payload), payload.len() as u32);
        self.buffer.clear();
        self.buffer.extend_from_slice(&header.encode());
        self.buffer.extend_from_slice(&payload);

        Ok(&self.buffer)
    }

    /// Decodes a command from a frame header and its payload bytes.
    ///
    /// Verifies the length and checksum before deserializing.
    pub fn decode_command(header: &FrameHeader, data: &[u8]) -> Result<Command, ProtocolError> {
        if data.len() != header.data_sz as usize {
            return Err(ProtocolError::Deserialisation(format!(
                "payload length mismatch: header says {}, got {}",
                header.data_sz,
                data.len()
            )));
        }

        let computed = checksum(data);
        if computed != header.data_checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: header.data_checksum,
                got: computed,
            });
        }

        decode_payload::<Command>(data)
    }

    /// Returns the internal buffer for inspection.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

/// Serialises a sub-payload message to bytes.
pub fn encode_payload<T>(value: &T) -> Result<Vec<u8>, ProtocolError>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value)
        .map(|b| b.to_vec())
        .map_err(|e| ProtocolError::Serialisation(e.to_string()))
}

/// Deserialises a sub-payload message from bytes.
pub fn decode_payload<T>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + Deserialize<T, HighDeserializer<RkyvError>>,
{
    rkyv::from_bytes::<T, RkyvError>(bytes)
        .map_err(|e| ProtocolError::Deserialisation(e.to_string()))
}
