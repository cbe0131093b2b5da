//! L2CAP frame headers

use super::constants::*;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Basic L2CAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        if data.len() < BASIC_HEADER_SIZE {
            return Err(L2capError::Truncated {
                what: "L2CAP header",
                needed: BASIC_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>()?;
        let channel_id = cursor.read_u16::<LittleEndian>()?;

        Ok(Self { length, channel_id })
    }

    pub fn to_bytes(&self) -> [u8; BASIC_HEADER_SIZE] {
        let [l0, l1] = self.length.to_le_bytes();
        let [c0, c1] = self.channel_id.to_le_bytes();
        [l0, l1, c0, c1]
    }
}

/// A complete basic-mode L2CAP PDU
#[derive(Clone, PartialEq, Eq)]
pub struct BasicFrame {
    pub channel_id: u16,
    pub payload: Vec<u8>,
}

impl BasicFrame {
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            channel_id,
            payload,
        }
    }

    /// Parse a reassembled PDU. The declared length must match exactly.
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capHeader::parse(data)?;
        let payload = &data[BASIC_HEADER_SIZE..];
        if payload.len() != header.length as usize {
            return Err(L2capError::LengthMismatch {
                declared: header.length as usize,
                actual: payload.len(),
            });
        }
        Ok(Self::new(header.channel_id, payload.to_vec()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = L2capHeader::new(self.payload.len() as u16, self.channel_id);
        let mut bytes = Vec::with_capacity(BASIC_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

impl std::fmt::Debug for BasicFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicFrame")
            .field("channel_id", &format_args!("0x{:04x}", self.channel_id))
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

/// Header of one command inside a signalling frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub code: u8,
    pub identifier: u8,
    pub length: u16,
}

impl CommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        if data.len() < COMMAND_HEADER_SIZE {
            return Err(L2capError::Truncated {
                what: "signalling command header",
                needed: COMMAND_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            code: cursor.read_u8()?,
            identifier: cursor.read_u8()?,
            length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let [l0, l1] = self.length.to_le_bytes();
        [self.code, self.identifier, l0, l1]
    }
}
