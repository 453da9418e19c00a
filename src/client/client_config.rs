use std::time::Duration;

pub const CLIENT_MAX_FUNDAMENTAL_FREQ: f64 = 200.0;
pub const CLIENT_MIN_FUNDAMENTAL_FREQ: f64 = 1.0;
pub const OUTBOX_PENDING_LIMIT: usize = 1000;
pub const INBOX_PENDING_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// one packet per tick, each answered by the server with a reply packet
    Synchronous,
    /// independent reader and writer, mail is pushed by the server as it arrives
    Asynchronous,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    /// must be unique among the broker's clients
    pub name: String,
    pub mode: ClientMode,

    /// communication ticks per second, clamped to 1..=200
    pub fundamental_frequency: f64,
    pub outbox_limit: usize,
    pub inbox_limit: usize,
    /// no warning when the outbox overflows
    pub expect_outbox_overflow: bool,
    /// put newly posted messages in front of older unsent ones
    pub post_newest_to_front: bool,
    /// keep the source of posted notifications instead of replacing it with our name
    pub fake_source: bool,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_packet_size: usize,
    pub disable_nagle: bool,

    pub do_local_time_correction: bool,
    /// minimum time between timing probes of an asynchronous client
    pub async_timing_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: &str, name: &str) -> ClientConfig {
        ClientConfig {
            server_addr: server_addr.to_string(),
            name: name.to_string(),
            mode: ClientMode::Synchronous,
            fundamental_frequency: 5.0,
            outbox_limit: OUTBOX_PENDING_LIMIT,
            inbox_limit: INBOX_PENDING_LIMIT,
            expect_outbox_overflow: false,
            post_newest_to_front: false,
            fake_source: false,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(10),
            max_packet_size: 64*1024*1024,
            disable_nagle: true,
            do_local_time_correction: true,
            async_timing_interval: Duration::from_secs(1),
        }
    }
}

pub fn clamp_frequency(frequency: f64) -> f64 {
    if frequency.is_nan() {
        return CLIENT_MIN_FUNDAMENTAL_FREQ;
    }
    frequency.clamp(CLIENT_MIN_FUNDAMENTAL_FREQ, CLIENT_MAX_FUNDAMENTAL_FREQ)
}
