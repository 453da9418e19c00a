//! The opening exchange on every connection: a fixed-width protocol token, the client's name
//!  message, and the server's `Welcome` (or `Poison`) reply.

use crate::comms::message::{DataType, Message, MessageType};
use crate::error::MoosError;


pub const PROTOCOL_TOKEN: &str = "ELKS CAN'T DANCE 2/8/10";
pub const PROTOCOL_TOKEN_LEN: usize = 32;

/// Reserved sequence id for administrative requests and their replies. There is only one, so a
///  client can have only one server request outstanding at a time.
pub const SERVER_REQUEST_ID: i32 = -2;

pub const ASYNCHRONOUS: &str = "asynchronous";
/// key of the timing probes asynchronous clients send to measure round trips
pub const ASYNC_TIMING_KEY: &str = "_async_timing";

pub fn protocol_token() -> [u8; PROTOCOL_TOKEN_LEN] {
    let mut result = [0u8; PROTOCOL_TOKEN_LEN];
    result[..PROTOCOL_TOKEN.len()].copy_from_slice(PROTOCOL_TOKEN.as_bytes());
    result
}

pub fn check_protocol_token(received: &[u8; PROTOCOL_TOKEN_LEN]) -> anyhow::Result<()> {
    if received == &protocol_token() {
        return Ok(());
    }

    let end = received.iter().position(|&b| b == 0).unwrap_or(PROTOCOL_TOKEN_LEN);
    Err(MoosError::ProtocolMismatch {
        expected: PROTOCOL_TOKEN.to_string(),
        received: String::from_utf8_lossy(&received[..end]).into_owned(),
    }.into())
}


/// Sent by the client right after the protocol token
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub name: String,
    pub asynchronous: bool,
    /// client's local time when sending, used by the server for an initial skew measurement
    pub client_time: f64,
}
impl HandshakeRequest {
    pub fn to_message(&self) -> Message {
        let key = if self.asynchronous { ASYNCHRONOUS } else { "" };
        Message::new_string(MessageType::Data, key, &self.name, self.client_time)
    }

    pub fn from_message(msg: &Message) -> anyhow::Result<HandshakeRequest> {
        if !msg.is_type(MessageType::Data) {
            return Err(MoosError::ProtocolMismatch {
                expected: "Data message carrying the client name".to_string(),
                received: format!("{:?} message", msg.msg_type),
            }.into());
        }
        let name = msg.string_value();
        if name.is_empty() {
            return Err(MoosError::ProtocolMismatch {
                expected: "non-empty client name".to_string(),
                received: "empty name".to_string(),
            }.into());
        }
        Ok(HandshakeRequest {
            name,
            asynchronous: msg.key == ASYNCHRONOUS,
            client_time: msg.time,
        })
    }
}


#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeResponse {
    Welcome(Welcome),
    Poison(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    /// server time minus client time as measured by the server during the handshake
    pub skew: f64,
    pub server_is_asynchronous: bool,
    pub server_hostname: String,
    pub community: String,
}

impl HandshakeResponse {
    pub fn to_message(&self) -> Message {
        match self {
            HandshakeResponse::Welcome(welcome) => {
                let mut msg = Message::new_double(MessageType::Welcome, "", welcome.skew, -1.0);
                msg.data_type = DataType::String;
                msg.payload = if welcome.server_is_asynchronous { ASYNCHRONOUS.into() } else { Default::default() };
                msg.source_aux = format!("hostname={}", welcome.server_hostname);
                msg.community = welcome.community.clone();
                msg
            }
            HandshakeResponse::Poison(reason) => {
                Message::new_string(MessageType::Poison, "", reason, -1.0)
            }
        }
    }

    pub fn from_message(msg: &Message) -> anyhow::Result<HandshakeResponse> {
        match msg.msg_type {
            MessageType::Poison => Ok(HandshakeResponse::Poison(msg.string_value())),
            MessageType::Welcome => {
                let server_hostname = msg.source_aux
                    .split(',')
                    .filter_map(|kv| kv.split_once('='))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("hostname"))
                    .map(|(_, v)| v.trim().to_string())
                    .unwrap_or_default();

                Ok(HandshakeResponse::Welcome(Welcome {
                    skew: msg.double_value,
                    server_is_asynchronous: msg.string_value().eq_ignore_ascii_case(ASYNCHRONOUS),
                    server_hostname,
                    community: msg.community.clone(),
                }))
            }
            other => Err(MoosError::ProtocolMismatch {
                expected: "Welcome or Poison".to_string(),
                received: format!("{:?}", other),
            }.into()),
        }
    }
}

pub fn duplicate_name_reason(name: &str) -> String {
    MoosError::DuplicateClientName(name.to_string()).to_string()
}
