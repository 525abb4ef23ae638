// Frame layout for the file conduit: a 40-byte header of five
// little-endian u64 fields, a header payload (operation arguments), and an
// optional trailing data payload. `this_length` separates the two.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::Cursor;

use crate::DeviceError;

use super::opcode::AfcOpcode;

/// `"CFA6LPAA"` as the little-endian u64 the wire carries.
pub const AFC_MAGIC: u64 = u64::from_le_bytes(*b"CFA6LPAA");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AfcPacketHeader {
    pub entire_len: u64,
    pub this_len: u64,
    pub tag: u64,
    pub operation: AfcOpcode,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN as usize);
        buf.write_u64::<LE>(AFC_MAGIC).unwrap();
        buf.write_u64::<LE>(self.entire_len).unwrap();
        buf.write_u64::<LE>(self.this_len).unwrap();
        buf.write_u64::<LE>(self.tag).unwrap();
        buf.write_u64::<LE>(self.operation as u64).unwrap();
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DeviceError> {
        if buf.len() < Self::LEN as usize {
            return Err(DeviceError::InvalidAfcMagic);
        }
        let mut c = Cursor::new(buf);
        if c.read_u64::<LE>().unwrap() != AFC_MAGIC {
            return Err(DeviceError::InvalidAfcMagic);
        }
        let entire_len = c.read_u64::<LE>().unwrap();
        let this_len = c.read_u64::<LE>().unwrap();
        let tag = c.read_u64::<LE>().unwrap();
        let raw_op = c.read_u64::<LE>().unwrap();
        let operation =
            AfcOpcode::try_from(raw_op).map_err(DeviceError::UnknownAfcOperation)?;
        if entire_len < Self::LEN || this_len < Self::LEN || this_len > entire_len {
            return Err(DeviceError::DtxDecode(format!(
                "inconsistent afc lengths: entire {entire_len}, this {this_len}"
            )));
        }
        Ok(Self {
            entire_len,
            this_len,
            tag,
            operation,
        })
    }
}

/// One frame, split into operation arguments and trailing payload.
#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacket {
    pub fn new(operation: AfcOpcode, tag: u64, header_payload: Vec<u8>, payload: Vec<u8>) -> Self {
        let this_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        let header = AfcPacketHeader {
            entire_len: this_len + payload.len() as u64,
            this_len,
            tag,
            operation,
        };
        Self {
            header,
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.header.serialize();
        buf.extend_from_slice(&self.header_payload);
        buf.extend_from_slice(&self.payload);
        buf
    }
}
