use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::comms::message::Message;
use crate::comms::packet::Packet;
use crate::comms::protocol::PROTOCOL_TOKEN_LEN;
use crate::error::MoosError;


/// An established TCP connection, split into halves that can be moved into separate reader
///  and writer tasks. Dropping both halves closes the socket.
pub struct Connection {
    pub reader: PacketReader,
    pub writer: PacketWriter,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, max_packet_size: usize, no_delay: bool) -> anyhow::Result<Connection> {
        if no_delay {
            stream.set_nodelay(true)?;
        }
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Connection {
            reader: PacketReader { stream: read_half, max_packet_size },
            writer: PacketWriter { stream: write_half },
            peer_addr,
            local_addr,
        })
    }
}

pub async fn connect(addr: &str, connect_timeout: Duration, max_packet_size: usize, no_delay: bool) -> anyhow::Result<Connection> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream.with_context(|| format!("connecting to {}", addr))?,
        Err(_) => return Err(MoosError::Timeout(format!("connecting to {}", addr)).into()),
    };
    debug!(addr, "connected");
    Connection::new(stream, max_packet_size, no_delay)
}

/// Binding the listen socket is the one failure the broker cannot recover from locally
pub async fn listen(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr).await
        .with_context(|| format!("binding listen socket to {}", addr))
}


pub struct PacketReader {
    stream: OwnedReadHalf,
    max_packet_size: usize,
}

impl PacketReader {
    pub async fn read_packet(&mut self) -> anyhow::Result<Packet> {
        let mut header = [0u8; Packet::HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let (total_len, _) = Packet::parse_header(&header, self.max_packet_size)?;

        let mut buf = vec![0u8; total_len];
        buf[..Packet::HEADER_LEN].copy_from_slice(&header);
        self.stream.read_exact(&mut buf[Packet::HEADER_LEN..]).await?;
        trace!(len = total_len, "read packet");

        Packet::try_deser(&buf)
    }

    /// `None` if nothing arrived within the timeout. A timeout can leave a partially read
    ///  packet behind, so callers treat it as fatal to the connection unless they only ever
    ///  use it while the peer is idle.
    pub async fn read_packet_timeout(&mut self, read_timeout: Duration) -> anyhow::Result<Option<Packet>> {
        match timeout(read_timeout, self.read_packet()).await {
            Ok(packet) => Ok(Some(packet?)),
            Err(_) => Ok(None),
        }
    }

    /// a single length-prefixed message outside of packet framing (handshake only)
    pub async fn read_message(&mut self, read_timeout: Duration) -> anyhow::Result<Message> {
        let read = async {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).await?;
            let len = i32::from_le_bytes(len_buf);
            if len < 4 || len as usize > self.max_packet_size {
                return Err(MoosError::MalformedPacket(format!("handshake message length {}", len)).into());
            }

            let mut buf = vec![0u8; len as usize];
            buf[..4].copy_from_slice(&len_buf);
            self.stream.read_exact(&mut buf[4..]).await?;
            Message::try_deser(&mut buf.as_slice())
        };

        match timeout(read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(MoosError::Timeout("waiting for handshake message".to_string()).into()),
        }
    }

    pub async fn read_protocol_token(&mut self, read_timeout: Duration) -> anyhow::Result<[u8; PROTOCOL_TOKEN_LEN]> {
        let mut buf = [0u8; PROTOCOL_TOKEN_LEN];
        match timeout(read_timeout, self.stream.read_exact(&mut buf)).await {
            Ok(result) => {
                result?;
                Ok(buf)
            }
            Err(_) => Err(MoosError::Timeout("waiting for protocol token".to_string()).into()),
        }
    }
}


pub struct PacketWriter {
    stream: OwnedWriteHalf,
}

impl PacketWriter {
    pub async fn write_packet(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let buf = packet.ser()?;
        self.write_raw(&buf).await
    }

    pub async fn write_message(&mut self, msg: &Message) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(msg.serialized_len());
        msg.ser(&mut buf);
        self.write_raw(&buf).await
    }

    pub async fn write_raw(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
