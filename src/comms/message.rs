use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::MoosError;
use crate::util::buf_ext::{BufExt, BufMutExt};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Notify = b'N',
    Register = b'R',
    Unregister = b'U',
    WildcardRegister = b'*',
    WildcardUnregister = b'/',
    NotSet = b'~',
    Command = b'C',
    Anonymous = b'A',
    Null = b'.',
    Data = b'i',
    Poison = b'K',
    Welcome = b'W',
    ServerRequest = b'Q',
    Timing = b'T',
    Terminate = b'^',
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataType {
    Double = b'D',
    String = b'S',
    Binary = b'B',
    NotSet = b'~',
}

/// The single unit of communication between clients and the broker.
///
/// Numeric fields default to -1, which is what peers expect for "not set".
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// per-connection sequence number, or [crate::comms::protocol::SERVER_REQUEST_ID]
    pub id: i32,
    pub msg_type: MessageType,
    pub data_type: DataType,
    pub source: String,
    pub source_aux: String,
    pub community: String,
    pub key: String,
    pub time: f64,
    pub double_value: f64,
    /// secondary numeric value, e.g. a write frequency or a registration interval hint
    pub double_value2: f64,
    /// string or binary payload, depending on `data_type`
    pub payload: Bytes,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            id: -1,
            msg_type: MessageType::Null,
            data_type: DataType::Double,
            source: String::new(),
            source_aux: String::new(),
            community: String::new(),
            key: String::new(),
            time: -1.0,
            double_value: -1.0,
            double_value2: -1.0,
            payload: Bytes::new(),
        }
    }
}

impl Message {
    /// fixed part: length, id, two type bytes, three doubles, five string length prefixes
    const FIXED_LEN: usize = 4 + 4 + 1 + 1 + 3*8 + 5*4;

    pub fn new_double(msg_type: MessageType, key: &str, value: f64, time: f64) -> Message {
        Message {
            msg_type,
            data_type: DataType::Double,
            key: key.to_string(),
            double_value: value,
            time,
            ..Default::default()
        }
    }

    pub fn new_string(msg_type: MessageType, key: &str, value: &str, time: f64) -> Message {
        Message {
            msg_type,
            data_type: DataType::String,
            key: key.to_string(),
            payload: Bytes::copy_from_slice(value.as_bytes()),
            time,
            ..Default::default()
        }
    }

    pub fn new_binary(msg_type: MessageType, key: &str, value: Bytes, time: f64) -> Message {
        Message {
            msg_type,
            data_type: DataType::Binary,
            key: key.to_string(),
            payload: value,
            time,
            ..Default::default()
        }
    }

    pub fn null(source: &str, value: f64) -> Message {
        Message {
            source: source.to_string(),
            double_value: value,
            ..Default::default()
        }
    }

    pub fn is_type(&self, msg_type: MessageType) -> bool {
        self.msg_type == msg_type
    }

    pub fn is_double(&self) -> bool {
        self.data_type == DataType::Double
    }

    pub fn is_string(&self) -> bool {
        self.data_type == DataType::String
    }

    pub fn is_binary(&self) -> bool {
        self.data_type == DataType::Binary
    }

    /// payload as text - lossy for binary payloads
    pub fn string_value(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN
            + self.source.len()
            + self.source_aux.len()
            + self.community.len()
            + self.key.len()
            + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.serialized_len() as i32);
        buf.put_i32_le(self.id);
        buf.put_u8(self.msg_type.into());
        buf.put_u8(self.data_type.into());
        buf.put_prefixed_string(&self.source);
        buf.put_prefixed_string(&self.source_aux);
        buf.put_prefixed_string(&self.community);
        buf.put_prefixed_string(&self.key);
        buf.put_f64_le(self.time);
        buf.put_f64_le(self.double_value);
        buf.put_f64_le(self.double_value2);
        buf.put_prefixed_bytes(&self.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        let remaining_at_start = buf.remaining();

        let declared_len = buf.get_checked_i32()?;
        if declared_len < Self::FIXED_LEN as i32 || declared_len as usize > remaining_at_start {
            return Err(MoosError::MalformedPacket(format!(
                "message declares {} bytes, {} bytes available", declared_len, remaining_at_start
            )).into());
        }
        let declared_len = declared_len as usize;

        let id = buf.get_checked_i32()?;
        let msg_type = buf.get_checked_u8()?;
        let msg_type = MessageType::try_from(msg_type)
            .map_err(|_| anyhow!(MoosError::MalformedPacket(format!("unknown message type {:?}", msg_type as char))))?;
        let data_type = buf.get_checked_u8()?;
        let data_type = DataType::try_from(data_type)
            .map_err(|_| anyhow!(MoosError::MalformedPacket(format!("unknown data type {:?}", data_type as char))))?;

        let source = buf.get_checked_string()?;
        let source_aux = buf.get_checked_string()?;
        let community = buf.get_checked_string()?;
        let key = buf.get_checked_string()?;
        let time = buf.get_checked_f64()?;
        let double_value = buf.get_checked_f64()?;
        let double_value2 = buf.get_checked_f64()?;
        let payload = buf.get_checked_bytes()?;

        let consumed = remaining_at_start - buf.remaining();
        if consumed != declared_len {
            return Err(MoosError::MalformedPacket(format!(
                "message declares {} bytes but its fields occupy {} bytes", declared_len, consumed
            )).into());
        }

        Ok(Message {
            id,
            msg_type,
            data_type,
            source,
            source_aux,
            community,
            key,
            time,
            double_value,
            double_value2,
            payload,
        })
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}=", self.msg_type, self.key)?;
        match self.data_type {
            DataType::Double => write!(f, "{}", self.double_value)?,
            DataType::String => write!(f, "{:?}", self.string_value())?,
            DataType::Binary => write!(f, "<{} bytes binary>", self.payload.len())?,
            DataType::NotSet => write!(f, "<not set>")?,
        }
        write!(f, " src={} time={:.3} id={}", self.source, self.time, self.id)
    }
}
