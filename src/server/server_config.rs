use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;

pub const DEFAULT_MOOS_SERVER_PORT: u16 = 9000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// sent to clients in the welcome message
    pub community: String,

    /// a client that sends nothing for this long is disconnected
    pub client_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub handshake_timeout: Duration,

    pub max_packet_size: usize,
    /// whether clients asking for asynchronous operation get unsolicited mail pushes
    pub support_async: bool,
    pub disable_nagle: bool,
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, community: &str) -> ServerConfig {
        ServerConfig {
            listen_addr,
            community: community.to_string(),
            client_timeout: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            max_packet_size: 64*1024*1024,
            support_async: true,
            disable_nagle: true,
        }
    }

    /// client timeout from (user supplied) seconds, which must be positive and finite
    pub fn with_client_timeout_secs(mut self, secs: f64) -> anyhow::Result<ServerConfig> {
        if secs <= 0.0 {
            return Err(anyhow!("client timeout must be positive, was {}", secs));
        }
        self.client_timeout = Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow!("invalid client timeout {}: {}", secs, e))?;
        Ok(self)
    }
}
