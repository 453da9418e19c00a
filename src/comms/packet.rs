use bytes::{Buf, BufMut, BytesMut};

use crate::comms::message::{Message, MessageType};
use crate::error::MoosError;
use crate::util::buf_ext::BufExt;


/// An ordered batch of messages framed as `[i32 total bytes][i32 message count][message]*`,
///  little endian throughout. The total includes the header itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    pub messages: Vec<Message>,
}

impl Packet {
    pub const HEADER_LEN: usize = 8;

    pub fn new(messages: Vec<Message>) -> Packet {
        Packet { messages }
    }

    pub fn ser(&self) -> anyhow::Result<BytesMut> {
        let total_len = Self::HEADER_LEN + self.messages.iter()
            .map(|m| m.serialized_len())
            .sum::<usize>();
        if total_len > i32::MAX as usize {
            return Err(MoosError::SerializationFailure(format!(
                "packet of {} messages needs {} bytes, exceeding the wire format's limit", self.messages.len(), total_len
            )).into());
        }

        let mut buf = BytesMut::with_capacity(total_len);
        // placeholder header, backpatched below
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        for msg in &self.messages {
            msg.ser(&mut buf);
        }

        let total_bytes = (buf.len() as i32).to_le_bytes();
        let count = (self.messages.len() as i32).to_le_bytes();
        buf[0..4].copy_from_slice(&total_bytes);
        buf[4..8].copy_from_slice(&count);
        Ok(buf)
    }

    /// Reads the header, returning the total packet length (including the header) and the
    ///  number of messages it announces
    pub fn parse_header(mut header: &[u8], max_packet_size: usize) -> anyhow::Result<(usize, usize)> {
        let total_len = header.get_checked_i32()?;
        let count = header.get_checked_i32()?;

        if total_len < Self::HEADER_LEN as i32 {
            return Err(MoosError::MalformedPacket(format!("packet length {} is shorter than its header", total_len)).into());
        }
        if total_len as usize > max_packet_size {
            return Err(MoosError::MalformedPacket(format!(
                "packet length {} exceeds the configured maximum of {}", total_len, max_packet_size
            )).into());
        }
        if count < 0 {
            return Err(MoosError::MalformedPacket(format!("negative message count {}", count)).into());
        }
        Ok((total_len as usize, count as usize))
    }

    /// Decodes a complete packet (header included). All messages are returned, `Null` messages
    ///  included; use [Packet::into_messages] to filter.
    pub fn try_deser(buf: &[u8]) -> anyhow::Result<Packet> {
        if buf.len() < Self::HEADER_LEN {
            return Err(MoosError::MalformedPacket(format!("{} bytes are too short for a packet header", buf.len())).into());
        }
        let (total_len, count) = Self::parse_header(&buf[..Self::HEADER_LEN], usize::MAX)?;
        if total_len != buf.len() {
            return Err(MoosError::MalformedPacket(format!(
                "packet header announces {} bytes, buffer has {}", total_len, buf.len()
            )).into());
        }

        let mut body = &buf[Self::HEADER_LEN..];
        // every message occupies at least its fixed part, so this bounds the allocation
        let mut messages = Vec::with_capacity(count.min(body.len() / 32));
        for _ in 0..count {
            messages.push(Message::try_deser(&mut body)?);
        }
        if body.has_remaining() {
            return Err(MoosError::MalformedPacket(format!(
                "{} trailing bytes after {} messages", body.remaining(), count
            )).into());
        }
        Ok(Packet { messages })
    }

    /// If the packet starts with a `Null` message, its value is the sender's transmit time
    pub fn db_time(&self) -> Option<f64> {
        self.messages.first()
            .filter(|m| m.is_type(MessageType::Null))
            .map(|m| m.double_value)
    }

    pub fn into_messages(self, include_null: bool) -> Vec<Message> {
        if include_null {
            self.messages
        }
        else {
            self.messages.into_iter()
                .filter(|m| !m.is_type(MessageType::Null))
                .collect()
        }
    }
}
