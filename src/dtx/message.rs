//! Wire codecs for the DTX protocol: the 32-byte frame header, the 16-byte
//! payload header, the argument-vector format, and fragment reassembly.
//!
//! A logical message can span several frames sharing a message id; each
//! frame carries `payload_length` bytes of the concatenated payload (the
//! announcement frame of a fragmented message carries zero) and the
//! assembled payload is only surfaced once the last fragment arrives.

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::nskeyed::{self, NsValue};
use crate::DeviceError;

pub const DTX_MAGIC: u32 = 0x1F3D5B79;
pub const DTX_HEADER_LEN: u32 = 32;

const AUX_MAGIC: u64 = 0x01F0;

/// Frame header, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtxMessageHeader {
    pub fragment_id: u16,
    pub fragment_count: u16,
    pub payload_length: u32,
    pub message_id: u32,
    pub conversation_index: u32,
    pub channel: u32,
    pub expects_reply: bool,
}

impl DtxMessageHeader {
    pub fn serialize(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        let mut c = Cursor::new(&mut buf[..]);
        c.write_u32::<LE>(DTX_MAGIC).unwrap();
        c.write_u32::<LE>(DTX_HEADER_LEN).unwrap();
        c.write_u16::<LE>(self.fragment_id).unwrap();
        c.write_u16::<LE>(self.fragment_count).unwrap();
        c.write_u32::<LE>(self.payload_length).unwrap();
        c.write_u32::<LE>(self.message_id).unwrap();
        c.write_u32::<LE>(self.conversation_index).unwrap();
        c.write_u32::<LE>(self.channel).unwrap();
        c.write_u32::<LE>(if self.expects_reply { 1 } else { 0 })
            .unwrap();
        buf
    }

    pub fn parse(buf: &[u8; 32]) -> Result<Self, DeviceError> {
        let mut c = Cursor::new(&buf[..]);
        let magic = c.read_u32::<LE>().unwrap();
        if magic != DTX_MAGIC {
            return Err(DeviceError::DtxDecode(format!("bad frame magic {magic:#x}")));
        }
        let header_length = c.read_u32::<LE>().unwrap();
        if header_length != DTX_HEADER_LEN {
            return Err(DeviceError::DtxDecode(format!(
                "unexpected header length {header_length}"
            )));
        }
        Ok(Self {
            fragment_id: c.read_u16::<LE>().unwrap(),
            fragment_count: c.read_u16::<LE>().unwrap(),
            payload_length: c.read_u32::<LE>().unwrap(),
            message_id: c.read_u32::<LE>().unwrap(),
            conversation_index: c.read_u32::<LE>().unwrap(),
            channel: c.read_u32::<LE>().unwrap(),
            expects_reply: c.read_u32::<LE>().unwrap() == 1,
        })
    }
}

/// Payload header: `flags, aux_length, total_length`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DtxPayloadHeader {
    pub flags: u32,
    pub aux_length: u32,
    pub total_length: u64,
}

impl DtxPayloadHeader {
    pub const LEN: usize = 16;

    pub fn serialize(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf[..]);
        c.write_u32::<LE>(self.flags).unwrap();
        c.write_u32::<LE>(self.aux_length).unwrap();
        c.write_u64::<LE>(self.total_length).unwrap();
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DeviceError> {
        if buf.len() < Self::LEN {
            return Err(DeviceError::DtxDecode("payload header too short".into()));
        }
        let mut c = Cursor::new(buf);
        Ok(Self {
            flags: c.read_u32::<LE>().unwrap(),
            aux_length: c.read_u32::<LE>().unwrap(),
            total_length: c.read_u64::<LE>().unwrap(),
        })
    }
}

/// One entry of the argument vector.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    /// An archived object (tag 2).
    Object(NsValue),
    /// A 32-bit integer (tags 3 and 5).
    U32(u32),
    /// A 64-bit integer (tags 4 and 6).
    U64(u64),
}

impl AuxValue {
    pub fn archived(value: impl Into<NsValue>) -> Self {
        Self::Object(value.into())
    }

    pub fn as_object(&self) -> Option<&NsValue> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U32(v) => Some(*v as u64),
            Self::U64(v) => Some(*v),
            Self::Object(NsValue::Int(i)) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }
}

/// Serializes an argument vector: the magic/length header followed by
/// `(10, tag, value)` triples.
pub fn encode_aux(values: &[AuxValue]) -> Result<Vec<u8>, DeviceError> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut body = Vec::new();
    for value in values {
        body.write_u32::<LE>(10).unwrap();
        match value {
            AuxValue::Object(v) => {
                let archived = nskeyed::encode(v)?;
                body.write_u32::<LE>(2).unwrap();
                body.write_u32::<LE>(archived.len() as u32).unwrap();
                body.extend_from_slice(&archived);
            }
            AuxValue::U32(v) => {
                body.write_u32::<LE>(3).unwrap();
                body.write_u32::<LE>(*v).unwrap();
            }
            AuxValue::U64(v) => {
                body.write_u32::<LE>(4).unwrap();
                body.write_u64::<LE>(*v).unwrap();
            }
        }
    }
    let mut out = Vec::with_capacity(16 + body.len());
    out.write_u64::<LE>(AUX_MAGIC).unwrap();
    out.write_u64::<LE>(body.len() as u64).unwrap();
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parses an argument vector back into values.
pub fn parse_aux(data: &[u8]) -> Result<Vec<AuxValue>, DeviceError> {
    if data.len() < 16 {
        return Err(DeviceError::DtxDecode("argument vector too short".into()));
    }
    let mut c = Cursor::new(&data[16..]);
    let mut values = Vec::new();
    loop {
        let tag_a = match c.read_u32::<LE>() {
            Ok(t) => t,
            Err(_) => break,
        };
        if tag_a != 10 {
            return Err(DeviceError::DtxDecode(format!(
                "argument entry does not start with 10: {tag_a}"
            )));
        }
        let tag_b = c
            .read_u32::<LE>()
            .map_err(|_| DeviceError::DtxDecode("truncated argument entry".into()))?;
        match tag_b {
            2 => {
                let len = c
                    .read_u32::<LE>()
                    .map_err(|_| DeviceError::DtxDecode("truncated object length".into()))?
                    as usize;
                let start = c.position() as usize;
                let slice = &data[16..];
                if start + len > slice.len() {
                    return Err(DeviceError::DtxDecode("object overruns vector".into()));
                }
                values.push(AuxValue::Object(nskeyed::decode(&slice[start..start + len])?));
                c.set_position((start + len) as u64);
            }
            3 | 5 => values.push(AuxValue::U32(c.read_u32::<LE>().map_err(|_| {
                DeviceError::DtxDecode("truncated u32 argument".into())
            })?)),
            4 | 6 => values.push(AuxValue::U64(c.read_u64::<LE>().map_err(|_| {
                DeviceError::DtxDecode("truncated u64 argument".into())
            })?)),
            other => {
                return Err(DeviceError::DtxDecode(format!(
                    "unknown argument tag {other}"
                )))
            }
        }
    }
    Ok(values)
}

/// The interpreted body of a DTX message.
#[derive(Debug, Clone, PartialEq)]
pub enum DtxPayload {
    /// Flag 0x00: nothing, used as an acknowledgment.
    Empty,
    /// Flag 0x02: a selector plus argument vector.
    Invocation {
        selector: NsValue,
        arguments: Vec<AuxValue>,
    },
    /// Flags 0x01/0x03/0x04: a single archived object.
    Object(NsValue),
    /// Flag 0x05: explicit null reply.
    NullReply,
}

impl DtxPayload {
    /// Parses an assembled payload, returning the effective flags and the
    /// interpreted body. The high nibble advertises block compression; the
    /// low byte is the effective flag (a genuinely compressed body would
    /// need inflation this protocol client does not implement).
    pub fn parse(payload: &[u8]) -> Result<(u32, Self), DeviceError> {
        if payload.is_empty() {
            return Ok((0, Self::Empty));
        }
        let header = DtxPayloadHeader::parse(payload)?;
        let flags = header.flags & 0xFF;
        let body = &payload[DtxPayloadHeader::LEN..];
        if (header.total_length as usize) > body.len() {
            return Err(DeviceError::DtxDecode("payload shorter than declared".into()));
        }

        match flags {
            0x00 => Ok((flags, Self::Empty)),
            0x02 => {
                let aux_len = header.aux_length as usize;
                let total = header.total_length as usize;
                if aux_len > total {
                    return Err(DeviceError::DtxDecode("aux overruns payload".into()));
                }
                let arguments = if aux_len > 0 {
                    parse_aux(&body[..aux_len])?
                } else {
                    Vec::new()
                };
                let selector = if total > aux_len {
                    nskeyed::decode(&body[aux_len..total])?
                } else {
                    NsValue::Null
                };
                Ok((flags, Self::Invocation { selector, arguments }))
            }
            0x01 | 0x03 | 0x04 => Ok((
                flags,
                Self::Object(nskeyed::decode(&body[..header.total_length as usize])?),
            )),
            0x05 => Ok((flags, Self::NullReply)),
            other => Err(DeviceError::DtxDecode(format!(
                "unknown payload flag {other:#x}"
            ))),
        }
    }

    /// Builds an invocation payload (flag 0x02).
    pub fn build_invocation(selector: &str, args: &[AuxValue]) -> Result<Vec<u8>, DeviceError> {
        let selector_data = nskeyed::encode(&NsValue::from(selector))?;
        let aux_data = encode_aux(args)?;
        let header = DtxPayloadHeader {
            flags: 0x02,
            aux_length: aux_data.len() as u32,
            total_length: (aux_data.len() + selector_data.len()) as u64,
        };
        let mut out = Vec::with_capacity(16 + aux_data.len() + selector_data.len());
        out.extend_from_slice(&header.serialize());
        out.extend_from_slice(&aux_data);
        out.extend_from_slice(&selector_data);
        Ok(out)
    }

    /// Builds the empty acknowledgment payload (flag 0x00).
    pub fn build_empty() -> Vec<u8> {
        DtxPayloadHeader::default().serialize().to_vec()
    }
}

/// A fully assembled incoming message.
#[derive(Debug, Clone, PartialEq)]
pub struct DtxMessage {
    pub channel: u32,
    pub message_id: u32,
    pub conversation_index: u32,
    pub expects_reply: bool,
    pub flags: u32,
    pub payload: DtxPayload,
}

impl DtxMessage {
    /// The selector string of an invocation payload, if it has one.
    pub fn selector(&self) -> Option<&str> {
        match &self.payload {
            DtxPayload::Invocation { selector, .. } => selector.as_str(),
            _ => None,
        }
    }

    pub fn arguments(&self) -> &[AuxValue] {
        match &self.payload {
            DtxPayload::Invocation { arguments, .. } => arguments,
            _ => &[],
        }
    }

    /// The single archived object of a result payload.
    pub fn object(&self) -> Option<&NsValue> {
        match &self.payload {
            DtxPayload::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// Serializes a single-frame outgoing message.
pub fn build_frame(
    message_id: u32,
    conversation_index: u32,
    channel: u32,
    expects_reply: bool,
    payload: &[u8],
) -> Vec<u8> {
    let header = DtxMessageHeader {
        fragment_id: 0,
        fragment_count: 1,
        payload_length: payload.len() as u32,
        message_id,
        conversation_index,
        channel,
        expects_reply,
    };
    let mut out = Vec::with_capacity(32 + payload.len());
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(payload);
    out
}

/// Buffers fragments keyed by message id until the last one lands.
#[derive(Debug, Default)]
pub struct FragmentPool {
    pending: HashMap<u32, (DtxMessageHeader, Vec<u8>)>,
}

impl FragmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame; returns the first header plus the assembled
    /// payload when the message is complete.
    pub fn push(
        &mut self,
        header: DtxMessageHeader,
        body: Vec<u8>,
    ) -> Option<(DtxMessageHeader, Vec<u8>)> {
        if header.fragment_count <= 1 {
            return Some((header, body));
        }
        let entry = self
            .pending
            .entry(header.message_id)
            .or_insert_with(|| (header, Vec::new()));
        entry.1.extend_from_slice(&body);
        if header.fragment_id == header.fragment_count - 1 {
            self.pending.remove(&header.message_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn header_round_trip_preserves_lengths() {
        let header = DtxMessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            payload_length: 0x1C2C,
            message_id: 2,
            conversation_index: 0,
            channel: 7,
            expects_reply: true,
        };
        let bytes = header.serialize();
        let parsed = DtxMessageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload_length, 0x1C2C);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 32);
    }

    #[test]
    fn frame_length_matches_payload() {
        let payload = DtxPayload::build_invocation("runningProcesses", &[]).unwrap();
        let frame = build_frame(3, 0, 2, true, &payload);
        let header = DtxMessageHeader::parse(frame[..32].try_into().unwrap()).unwrap();
        assert_eq!(header.payload_length as usize, payload.len());
        assert_eq!(frame.len(), 32 + payload.len());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = DtxMessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            payload_length: 0,
            message_id: 1,
            conversation_index: 0,
            channel: 0,
            expects_reply: false,
        }
        .serialize();
        bytes[0] = 0xAA;
        match DtxMessageHeader::parse(&bytes).unwrap_err() {
            DeviceError::DtxDecode(_) => {}
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn argv_round_trip() {
        let mut dict = Map::new();
        dict.insert("k".to_string(), NsValue::Int(1));
        let args = vec![
            AuxValue::U32(42),
            AuxValue::archived("hi"),
            AuxValue::Object(NsValue::Dictionary(dict.clone())),
        ];

        let encoded = encode_aux(&args).unwrap();
        let decoded = parse_aux(&encoded).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], AuxValue::U32(42));
        assert_eq!(decoded[1], AuxValue::Object(NsValue::from("hi")));
        assert_eq!(decoded[2], AuxValue::Object(NsValue::Dictionary(dict)));
    }

    #[test]
    fn argv_u64_round_trip() {
        let args = vec![AuxValue::U64(0x1_0000_0001)];
        let decoded = parse_aux(&encode_aux(&args).unwrap()).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn argv_unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&AUX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&12u64.to_le_bytes());
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(&9u32.to_le_bytes()); // no such tag
        buf.extend_from_slice(&0u32.to_le_bytes());
        match parse_aux(&buf).unwrap_err() {
            DeviceError::DtxDecode(msg) => assert!(msg.contains("unknown argument tag")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn invocation_payload_round_trip() {
        let payload =
            DtxPayload::build_invocation("setConfig:", &[AuxValue::U32(9)]).unwrap();
        let (flags, parsed) = DtxPayload::parse(&payload).unwrap();
        assert_eq!(flags, 0x02);
        match parsed {
            DtxPayload::Invocation { selector, arguments } => {
                assert_eq!(selector.as_str(), Some("setConfig:"));
                assert_eq!(arguments, vec![AuxValue::U32(9)]);
            }
            other => panic!("parsed to {other:?}"),
        }
    }

    #[test]
    fn compression_nibble_is_masked() {
        let object = nskeyed::encode(&NsValue::Int(5)).unwrap();
        let header = DtxPayloadHeader {
            flags: 0x1003,
            aux_length: 0,
            total_length: object.len() as u64,
        };
        let mut payload = header.serialize().to_vec();
        payload.extend_from_slice(&object);

        let (flags, parsed) = DtxPayload::parse(&payload).unwrap();
        assert_eq!(flags, 0x03);
        assert_eq!(parsed, DtxPayload::Object(NsValue::Int(5)));
    }

    #[test]
    fn empty_and_null_payloads() {
        let (flags, parsed) = DtxPayload::parse(&DtxPayload::build_empty()).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(parsed, DtxPayload::Empty);

        let header = DtxPayloadHeader {
            flags: 0x05,
            aux_length: 0,
            total_length: 0,
        };
        let (flags, parsed) = DtxPayload::parse(&header.serialize()).unwrap();
        assert_eq!(flags, 0x05);
        assert_eq!(parsed, DtxPayload::NullReply);
    }

    #[test]
    fn fragments_assemble_in_arrival_order() {
        let mut pool = FragmentPool::new();
        let base = DtxMessageHeader {
            fragment_id: 0,
            fragment_count: 3,
            payload_length: 1,
            message_id: 7,
            conversation_index: 1,
            channel: 0,
            expects_reply: false,
        };

        assert!(pool.push(base, b"A".to_vec()).is_none());
        let second = DtxMessageHeader {
            fragment_id: 1,
            payload_length: 2,
            ..base
        };
        assert!(pool.push(second, b"BB".to_vec()).is_none());
        let third = DtxMessageHeader {
            fragment_id: 2,
            payload_length: 3,
            ..base
        };
        let (header, assembled) = pool.push(third, b"CCC".to_vec()).unwrap();

        assert_eq!(assembled, b"ABBCCC");
        assert_eq!(assembled.len(), 6);
        assert_eq!(header.message_id, 7);
        assert_eq!(header.conversation_index, 1);
    }

    #[test]
    fn single_fragment_passes_straight_through() {
        let mut pool = FragmentPool::new();
        let header = DtxMessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            payload_length: 2,
            message_id: 1,
            conversation_index: 0,
            channel: 0,
            expects_reply: false,
        };
        let (h, body) = pool.push(header, b"ok".to_vec()).unwrap();
        assert_eq!(h, header);
        assert_eq!(body, b"ok");
    }
}
