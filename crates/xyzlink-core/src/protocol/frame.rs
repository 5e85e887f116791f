//! Transfer frame encoding/decoding
//!
//! During an upload the file is streamed as binary frames interleaved with the
//! text protocol:
//!
//! - 4 bytes: block index
//! - 4 bytes: payload size
//! - N bytes: payload (at most one transfer block)
//! - 4 bytes: trailer
//!
//! Field byte order and the trailer flavour depend on the [`TransferProfile`].

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Default transfer block size
pub const BLOCK_SIZE: usize = 8192;

/// XOR key for the marker trailer
pub const MARKER_KEY: u32 = 0x5A5A_A5A5;

/// Bytes of framing around each payload
pub const FRAME_OVERHEAD: usize = 12;

/// Byte order of the frame header and trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOrder {
    Big,
    Little,
}

/// What the last four bytes of a frame carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailerKind {
    /// `index ^ 0x5A5AA5A5`
    XorMarker,
    /// CRC32 of the payload
    Crc32,
}

/// Transfer protocol variant
///
/// Firmware revisions disagree on framing details, so they are configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProfile {
    pub byte_order: WireOrder,
    pub trailer: TrailerKind,
    /// Wait for `ok` after every frame
    pub per_block_ack: bool,
    /// Bracket the transfer with `upload=` / `uploadDidFinish`
    pub explicit_init: bool,
}

impl TransferProfile {
    /// Little-endian, XOR marker, acknowledged blocks, explicit upload slot
    pub fn acknowledged() -> Self {
        Self {
            byte_order: WireOrder::Little,
            trailer: TrailerKind::XorMarker,
            per_block_ack: true,
            explicit_init: true,
        }
    }

    /// Big-endian, CRC32 trailer, no per-block acknowledgement
    pub fn streaming() -> Self {
        Self {
            byte_order: WireOrder::Big,
            trailer: TrailerKind::Crc32,
            per_block_ack: false,
            explicit_init: false,
        }
    }

    fn read_u32(&self, buf: &[u8]) -> u32 {
        match self.byte_order {
            WireOrder::Big => BigEndian::read_u32(buf),
            WireOrder::Little => LittleEndian::read_u32(buf),
        }
    }

    fn write_u32(&self, buf: &mut [u8], value: u32) {
        match self.byte_order {
            WireOrder::Big => BigEndian::write_u32(buf, value),
            WireOrder::Little => LittleEndian::write_u32(buf, value),
        }
    }

    fn trailer_for(&self, index: u32, payload: &[u8]) -> u32 {
        match self.trailer {
            TrailerKind::XorMarker => index ^ MARKER_KEY,
            TrailerKind::Crc32 => {
                let mut hasher = Hasher::new();
                hasher.update(payload);
                hasher.finalize()
            }
        }
    }
}

impl Default for TransferProfile {
    fn default() -> Self {
        Self::streaming()
    }
}

/// One numbered block of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrame {
    pub index: u32,
    pub payload: Vec<u8>,
}

impl TransferFrame {
    pub fn new(index: u32, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }

    /// Encode the frame to raw bytes
    pub fn encode(&self, profile: &TransferProfile) -> Vec<u8> {
        let len = self.payload.len();
        let mut bytes = vec![0u8; FRAME_OVERHEAD + len];

        profile.write_u32(&mut bytes[0..4], self.index);
        profile.write_u32(&mut bytes[4..8], len as u32);
        bytes[8..8 + len].copy_from_slice(&self.payload);
        profile.write_u32(
            &mut bytes[8 + len..],
            profile.trailer_for(self.index, &self.payload),
        );

        bytes
    }

    /// Decode one frame from the front of `data`
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(data: &[u8], profile: &TransferProfile) -> Result<(Self, usize), ProtocolError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::FrameTooShort {
                needed: FRAME_OVERHEAD,
                available: data.len(),
            });
        }

        let index = profile.read_u32(&data[0..4]);
        let length = profile.read_u32(&data[4..8]) as usize;

        if length > BLOCK_SIZE {
            return Err(ProtocolError::FrameTooLong {
                length,
                max: BLOCK_SIZE,
            });
        }

        let total = FRAME_OVERHEAD + length;
        if data.len() < total {
            return Err(ProtocolError::FrameTooShort {
                needed: total,
                available: data.len(),
            });
        }

        let payload = data[8..8 + length].to_vec();
        let received = profile.read_u32(&data[8 + length..total]);
        let expected = profile.trailer_for(index, &payload);

        if received != expected {
            return Err(match profile.trailer {
                TrailerKind::Crc32 => ProtocolError::CrcMismatch {
                    expected,
                    actual: received,
                },
                TrailerKind::XorMarker => ProtocolError::MarkerMismatch {
                    index,
                    expected,
                    actual: received,
                },
            });
        }

        Ok((Self { index, payload }, total))
    }
}

/// Rebuilds a file from frames, enforcing sequential indices
#[derive(Debug)]
pub struct Reassembler {
    profile: TransferProfile,
    next_index: u32,
    data: Vec<u8>,
}

impl Reassembler {
    pub fn new(profile: TransferProfile) -> Self {
        Self {
            profile,
            next_index: 0,
            data: Vec::new(),
        }
    }

    /// Accept one decoded frame
    pub fn push(&mut self, frame: TransferFrame) -> Result<(), ProtocolError> {
        if frame.index != self.next_index {
            return Err(ProtocolError::OutOfOrder {
                expected: self.next_index,
                actual: frame.index,
            });
        }
        self.data.extend_from_slice(&frame.payload);
        self.next_index += 1;
        Ok(())
    }

    /// Decode and accept every frame in a raw byte stream
    pub fn push_bytes(&mut self, mut bytes: &[u8]) -> Result<(), ProtocolError> {
        while !bytes.is_empty() {
            let (frame, used) = TransferFrame::decode(bytes, &self.profile)?;
            self.push(frame)?;
            bytes = &bytes[used..];
        }
        Ok(())
    }

    /// Number of frames accepted so far
    pub fn frames(&self) -> u32 {
        self.next_index
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}
