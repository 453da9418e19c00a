use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::active_queue::{ActiveMailHandler, ActiveQueueRouter};
use crate::client::async_comms::AsyncComms;
use crate::client::client_config::{clamp_frequency, ClientConfig, ClientMode};
use crate::client::comms_status::{ClientCommsStatus, CommsStatusCollector, CLIENT_SUMMARIES_QUEUE};
use crate::client::mailbox::Mailbox;
use crate::client::sync_comms::SyncComms;
use crate::comms::message::{Message, MessageType};
use crate::comms::packet::Packet;
use crate::comms::protocol::{protocol_token, HandshakeRequest, HandshakeResponse, Welcome, SERVER_REQUEST_ID};
use crate::comms::skew_filter::SkewFilter;
use crate::comms::transport::{connect, Connection};
use crate::db::moos_db::{DB_QOS, DB_RWSUMMARY};
use crate::db::msg_filter::MsgFilter;
use crate::error::MoosError;
use crate::runtime_context::RuntimeContext;
use crate::util::exponential_backoff::ExponentialBackoff;
use crate::util::wildcard::wildcard_match;

const SERVER_REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Application hooks of a comm client. Every method defaults to doing nothing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientEventHandler: Send + Sync + 'static {
    /// called after every successful (re)connect, after stored subscriptions were replayed
    async fn on_connect(&self) {}
    async fn on_disconnect(&self) {}
    /// new mail is waiting in the inbox
    async fn on_mail(&self) {}
}

struct NoEventHandler;

#[async_trait]
impl ClientEventHandler for NoEventHandler {}

/// How a connected client exchanges packets with the server. Connecting, handshake and
///  reconnecting are shared, only the exchange on an established connection differs.
#[async_trait]
pub(crate) trait CommsStrategy: Send + Sync + 'static {
    fn is_asynchronous(&self) -> bool;

    /// runs until the connection fails
    async fn run(&self, core: &ClientCore, connection: Connection) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommsCounters {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct AtomicCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Everything the client ever subscribed to, replayed after each (re)connect
#[derive(Default)]
struct Subscriptions {
    registered: BTreeMap<String, f64>,
    wildcards: Vec<MsgFilter>,
}

#[derive(Debug, Clone, Default)]
struct SessionInfo {
    community: String,
    server_hostname: String,
    server_is_asynchronous: bool,
}

pub(crate) struct ClientCore {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) runtime: Arc<RuntimeContext>,
    handler: Arc<dyn ClientEventHandler>,

    outbox: Mutex<Mailbox>,
    inbox: Mutex<Mailbox>,
    /// wakes the writer up for an immediate send
    pub(crate) outbox_signal: Notify,
    router: Mutex<ActiveQueueRouter>,
    subscriptions: Mutex<Subscriptions>,
    session: RwLock<SessionInfo>,
    comms_statuses: Arc<RwLock<FxHashMap<String, ClientCommsStatus>>>,

    skew_filter: Mutex<SkewFilter>,
    skew_bits: AtomicU64,
    time_correction: AtomicBool,

    frequency_bits: AtomicU64,
    expect_outbox_overflow: AtomicBool,
    connected: AtomicBool,
    next_msg_id: AtomicI32,
    counters: AtomicCounters,
    cancel_sender: broadcast::Sender<()>,
}

impl ClientCore {
    fn new(config: Arc<ClientConfig>, runtime: Arc<RuntimeContext>, handler: Arc<dyn ClientEventHandler>) -> ClientCore {
        let (cancel_sender, _) = broadcast::channel(1);
        ClientCore {
            outbox: Mutex::new(Mailbox::new("outbox", config.outbox_limit)),
            inbox: Mutex::new(Mailbox::new("inbox", config.inbox_limit)),
            outbox_signal: Notify::new(),
            router: Mutex::new(ActiveQueueRouter::new()),
            subscriptions: Default::default(),
            session: Default::default(),
            comms_statuses: Default::default(),
            skew_filter: Mutex::new(SkewFilter::new()),
            skew_bits: AtomicU64::new(0.0f64.to_bits()),
            time_correction: AtomicBool::new(false),
            frequency_bits: AtomicU64::new(clamp_frequency(config.fundamental_frequency).to_bits()),
            expect_outbox_overflow: AtomicBool::new(config.expect_outbox_overflow),
            connected: AtomicBool::new(false),
            next_msg_id: AtomicI32::new(0),
            counters: Default::default(),
            cancel_sender,
            config,
            runtime,
            handler,
        }
    }

    pub(crate) fn moos_time(&self) -> f64 {
        self.runtime.local_time() + f64::from_bits(self.skew_bits.load(Ordering::Acquire))
    }

    pub(crate) fn comms_tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from_bits(self.frequency_bits.load(Ordering::Acquire)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn post(&self, msg: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.enqueue(self.with_defaults(msg)).await;
        true
    }

    /// fills in the fields the client owns: source, sequence id and a missing timestamp
    fn with_defaults(&self, mut msg: Message) -> Message {
        let keep_source = self.config.fake_source && msg.is_type(MessageType::Notify) && !msg.source.is_empty();
        if !keep_source {
            msg.source = self.config.name.clone();
        }
        msg.id = if msg.is_type(MessageType::ServerRequest) {
            SERVER_REQUEST_ID
        }
        else {
            self.next_msg_id.fetch_add(1, Ordering::Relaxed)
        };
        if msg.time < 0.0 {
            msg.time = self.moos_time();
        }
        msg
    }

    async fn enqueue(&self, msg: Message) {
        let overflow = {
            let mut outbox = self.outbox.lock().await;
            if self.config.post_newest_to_front {
                outbox.push_front(msg)
            }
            else {
                outbox.push_back(msg)
            }
        };
        if let Some(e) = overflow {
            if !self.expect_outbox_overflow.load(Ordering::Acquire) {
                warn!(client = %self.config.name, "{}", e);
            }
        }

        if self.config.mode == ClientMode::Asynchronous {
            self.outbox_signal.notify_one();
        }
    }

    /// The pending outbox. If there is nothing to send, a `Null` message keeps the connection
    ///  alive and collects held mail.
    pub(crate) async fn take_outgoing(&self) -> Vec<Message> {
        let mut messages = self.outbox.lock().await.drain();
        if messages.is_empty() {
            // the time stamp lets the broker measure our latency
            let mut keep_alive = Message::null(&self.config.name, self.runtime.local_time());
            keep_alive.time = self.moos_time();
            messages.push(keep_alive);
        }
        messages
    }

    pub(crate) fn record_sent(&self, packet: &Packet) {
        self.counters.messages_sent.fetch_add(packet.messages.len() as u64, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(packet_len(packet), Ordering::Relaxed);
    }

    /// Handles a packet from the server. `request_time` is the local send time of the packet
    ///  this one answers, if it is an answer (synchronous exchange).
    pub(crate) async fn on_packet(&self, packet: Packet, request_time: Option<f64>) {
        let reply_time = self.runtime.local_time();
        self.counters.messages_received.fetch_add(packet.messages.len() as u64, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(packet_len(&packet), Ordering::Relaxed);

        if let (Some(request_time), Some(remote_time)) = (request_time, packet.db_time()) {
            self.update_skew(request_time, remote_time, reply_time).await;
        }

        let (timing, messages): (Vec<Message>, Vec<Message>) = packet.into_messages(false)
            .into_iter()
            .partition(|m| m.is_type(MessageType::Timing));
        for echo in timing {
            self.update_skew(echo.double_value, echo.time, reply_time).await;
        }

        self.deliver(messages).await;
    }

    async fn update_skew(&self, request_time: f64, remote_time: f64, reply_time: f64) {
        if !self.time_correction.load(Ordering::Acquire) {
            return;
        }
        let estimate = self.skew_filter.lock().await
            .update(request_time, remote_time, reply_time);
        trace!(skew = estimate.skew, lower_bound = estimate.lower_bound, upper_bound = estimate.upper_bound, "skew updated");
        self.skew_bits.store(estimate.skew.to_bits(), Ordering::Release);
    }

    async fn deliver(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }

        // replies to server requests are always left for the requester to pick up
        let (replies, mail): (Vec<Message>, Vec<Message>) = messages.into_iter()
            .partition(|m| m.id == SERVER_REQUEST_ID);
        let unclaimed = self.router.lock().await
            .route(mail);
        if replies.is_empty() && unclaimed.is_empty() {
            return;
        }

        {
            let mut inbox = self.inbox.lock().await;
            for msg in replies.into_iter().chain(unclaimed) {
                if let Some(e) = inbox.push_back(msg) {
                    warn!(client = %self.config.name, "{}", e);
                }
            }
        }
        self.handler.on_mail().await;
    }

    async fn on_connected(&self, connection: &Connection, welcome: &Welcome) {
        *self.session.write().await = SessionInfo {
            community: welcome.community.clone(),
            server_hostname: welcome.server_hostname.clone(),
            server_is_asynchronous: welcome.server_is_asynchronous,
        };

        // a broker on our own host shares our clock
        let correction = self.config.do_local_time_correction
            && welcome.server_hostname != connection.local_addr.ip().to_string();
        *self.skew_filter.lock().await = SkewFilter::new();
        self.time_correction.store(correction, Ordering::Release);
        let skew = if correction { welcome.skew } else { 0.0 };
        self.skew_bits.store(skew.to_bits(), Ordering::Release);

        self.connected.store(true, Ordering::Release);
        info!(client = %self.config.name, server = %connection.peer_addr, community = %welcome.community, skew, "connected");

        self.replay_subscriptions().await;
        self.handler.on_connect().await;
    }

    async fn on_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.handler.on_disconnect().await;
        }
    }

    async fn replay_subscriptions(&self) {
        let messages = {
            let subscriptions = self.subscriptions.lock().await;
            let time = self.moos_time();
            subscriptions.registered.iter()
                .map(|(key, interval)| register_message(key, *interval, time))
                .chain(subscriptions.wildcards.iter()
                    .map(|filter| wildcard_message(MessageType::WildcardRegister, filter, time)))
                .collect::<Vec<_>>()
        };
        if !messages.is_empty() {
            debug!(client = %self.config.name, num_subscriptions = messages.len(), "replaying subscriptions");
        }
        for msg in messages {
            self.enqueue(self.with_defaults(msg)).await;
        }
    }
}

fn packet_len(packet: &Packet) -> u64 {
    (Packet::HEADER_LEN + packet.messages.iter().map(|m| m.serialized_len()).sum::<usize>()) as u64
}

fn register_message(key: &str, interval: f64, time: f64) -> Message {
    Message::new_double(MessageType::Register, key, interval, time)
}

fn wildcard_message(msg_type: MessageType, filter: &MsgFilter, time: f64) -> Message {
    Message::new_string(msg_type, &filter.var_pattern, &filter.to_string(), time)
}

#[instrument(name = "moos_client", skip_all, fields(client = %core.config.name, server = %core.config.server_addr))]
async fn connection_loop(core: Arc<ClientCore>, strategy: Arc<dyn CommsStrategy>, mut cancel: broadcast::Receiver<()>) {
    let mut backoff = ExponentialBackoff::new(core.config.reconnect_backoff_initial, core.config.reconnect_backoff_max);

    loop {
        let result = select! {
            result = connect_and_run(&core, strategy.as_ref(), &mut backoff) => result,
            _ = cancel.recv() => break,
        };
        core.on_disconnected().await;

        if let Err(e) = result {
            match e.downcast_ref::<MoosError>() {
                // the name may be freed up by the time we retry, e.g. when we replace a crashed process
                Some(MoosError::Poisoned(reason)) => error!("server rejected the connection: {}", reason),
                _ => warn!("connection failed: {}", e),
            }
        }

        let delay = backoff.next_delay();
        debug!("reconnecting in {:?}", delay);
        select! {
            _ = sleep(delay) => {}
            _ = cancel.recv() => break,
        }
    }

    core.on_disconnected().await;
    debug!("client terminated");
}

async fn connect_and_run(core: &ClientCore, strategy: &dyn CommsStrategy, backoff: &mut ExponentialBackoff) -> anyhow::Result<()> {
    let config = &core.config;
    let mut connection = connect(&config.server_addr, config.connect_timeout, config.max_packet_size, config.disable_nagle).await?;
    let welcome = handshake(core, &mut connection, strategy.is_asynchronous()).await?;

    backoff.reset();
    core.on_connected(&connection, &welcome).await;
    strategy.run(core, connection).await
}

async fn handshake(core: &ClientCore, connection: &mut Connection, asynchronous: bool) -> anyhow::Result<Welcome> {
    connection.writer.write_raw(&protocol_token()).await?;

    let request = HandshakeRequest {
        name: core.config.name.clone(),
        asynchronous,
        client_time: core.runtime.local_time(),
    };
    connection.writer.write_message(&request.to_message()).await?;

    let response = connection.reader.read_message(core.config.read_timeout).await?;
    match HandshakeResponse::from_message(&response)? {
        HandshakeResponse::Welcome(welcome) => Ok(welcome),
        HandshakeResponse::Poison(reason) => Err(MoosError::Poisoned(reason).into()),
    }
}

/// Handle to a client connection to a MOOS broker. Clones share the same connection.
///
/// The client keeps (re)connecting in the background until [MoosCommClient::close] is called.
///  Subscriptions are remembered and re-issued after every reconnect.
#[derive(Clone)]
pub struct MoosCommClient {
    core: Arc<ClientCore>,
}

impl MoosCommClient {
    pub fn start(config: Arc<ClientConfig>, runtime: Arc<RuntimeContext>) -> MoosCommClient {
        Self::start_with_handler(config, runtime, Arc::new(NoEventHandler))
    }

    pub fn start_with_handler(config: Arc<ClientConfig>, runtime: Arc<RuntimeContext>, handler: Arc<dyn ClientEventHandler>) -> MoosCommClient {
        let strategy: Arc<dyn CommsStrategy> = match config.mode {
            ClientMode::Synchronous => Arc::new(SyncComms),
            ClientMode::Asynchronous => Arc::new(AsyncComms),
        };

        let core = Arc::new(ClientCore::new(config, runtime, handler));
        tokio::spawn(connection_loop(core.clone(), strategy, core.cancel_sender.subscribe()));
        MoosCommClient { core }
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// true if connected before the timeout
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(SERVER_REQUEST_POLL_INTERVAL).await;
        }
        true
    }

    /// local time corrected by the skew to the broker's clock
    pub fn moos_time(&self) -> f64 {
        self.core.moos_time()
    }

    /// the community of the broker we are (or were last) connected to
    pub async fn community(&self) -> String {
        self.core.session.read().await.community.clone()
    }

    pub async fn server_is_asynchronous(&self) -> bool {
        self.core.session.read().await.server_is_asynchronous
    }

    pub async fn server_hostname(&self) -> String {
        self.core.session.read().await.server_hostname.clone()
    }

    /// Queues a message for sending and returns immediately. Returns false (dropping the
    ///  message) while not connected.
    pub async fn post(&self, msg: Message) -> bool {
        self.core.post(msg).await
    }

    pub async fn notify_double(&self, key: &str, value: f64, source_aux: Option<&str>) -> bool {
        self.notify(Message::new_double(MessageType::Notify, key, value, -1.0), source_aux).await
    }

    pub async fn notify_string(&self, key: &str, value: &str, source_aux: Option<&str>) -> bool {
        self.notify(Message::new_string(MessageType::Notify, key, value, -1.0), source_aux).await
    }

    pub async fn notify_binary(&self, key: &str, value: Bytes, source_aux: Option<&str>) -> bool {
        self.notify(Message::new_binary(MessageType::Notify, key, value, -1.0), source_aux).await
    }

    async fn notify(&self, mut msg: Message, source_aux: Option<&str>) -> bool {
        if let Some(source_aux) = source_aux {
            msg.source_aux = source_aux.to_string();
        }
        self.post(msg).await
    }

    /// Subscribes to a variable, getting at most one notification per `interval` seconds
    ///  (0 for every write). Takes effect at the next connect if currently disconnected.
    pub async fn register(&self, key: &str, interval: f64) -> bool {
        self.core.subscriptions.lock().await
            .registered.insert(key.to_string(), interval);
        if self.is_connected() {
            self.post(register_message(key, interval, -1.0)).await;
        }
        true
    }

    /// false if there was no such registration
    pub async fn unregister(&self, key: &str) -> bool {
        if self.core.subscriptions.lock().await.registered.remove(key).is_none() {
            return false;
        }
        self.post(Message::new_double(MessageType::Unregister, key, 0.0, -1.0)).await;
        true
    }

    pub async fn register_wildcard(&self, var_pattern: &str, app_pattern: &str, interval: f64) -> bool {
        let filter = MsgFilter::new(var_pattern, app_pattern, interval);
        {
            let mut subscriptions = self.core.subscriptions.lock().await;
            subscriptions.wildcards.retain(|f| !f.has_same_patterns(&filter));
            subscriptions.wildcards.push(filter.clone());
        }
        if self.is_connected() {
            self.post(wildcard_message(MessageType::WildcardRegister, &filter, -1.0)).await;
        }
        true
    }

    pub async fn unregister_wildcard(&self, var_pattern: &str, app_pattern: &str) -> bool {
        let filter = MsgFilter::new(var_pattern, app_pattern, 0.0);
        {
            let mut subscriptions = self.core.subscriptions.lock().await;
            let num_before = subscriptions.wildcards.len();
            subscriptions.wildcards.retain(|f| !f.has_same_patterns(&filter));
            if subscriptions.wildcards.len() == num_before {
                return false;
            }
        }
        self.post(wildcard_message(MessageType::WildcardUnregister, &filter, -1.0)).await;
        true
    }

    /// true if a registration or wildcard registration covers `key`
    pub async fn is_registered_for(&self, key: &str) -> bool {
        let subscriptions = self.core.subscriptions.lock().await;
        subscriptions.registered.contains_key(key)
            || subscriptions.wildcards.iter().any(|f| wildcard_match(&f.var_pattern, key))
    }

    /// all mail received since the last call
    pub async fn fetch(&self) -> Vec<Message> {
        self.core.inbox.lock().await.drain()
    }

    /// Takes the messages with the given sequence id out of the inbox, optionally discarding
    ///  everything else
    pub async fn peek(&self, id: i32, clear_others: bool) -> Vec<Message> {
        let mut inbox = self.core.inbox.lock().await;
        let result = inbox.extract(|m| m.id == id);
        if clear_others {
            inbox.clear();
        }
        result
    }

    /// Sends an administrative request (e.g. `ALL`, `PROC_SUMMARY`, `VAR_SUMMARY`, `DB_CLEAR`)
    ///  and waits for the reply.
    ///
    /// All server requests share one sequence id, so only one can be outstanding at a time:
    ///  replies to an earlier, abandoned request are returned along with this one's.
    pub async fn server_request(&self, what: &str, timeout: Duration) -> anyhow::Result<Vec<Message>> {
        if !self.post(Message::new_string(MessageType::ServerRequest, what, "", -1.0)).await {
            return Err(MoosError::NotConnected.into());
        }
        self.flush();

        let deadline = Instant::now() + timeout;
        loop {
            let replies = self.peek(SERVER_REQUEST_ID, false).await;
            if !replies.is_empty() {
                return Ok(replies);
            }
            if Instant::now() >= deadline {
                return Err(MoosError::Timeout(format!("server request {}", what)).into());
            }
            sleep(SERVER_REQUEST_POLL_INTERVAL).await;
        }
    }

    /// sends pending mail now instead of waiting for the next tick
    pub fn flush(&self) {
        self.core.outbox_signal.notify_one();
    }

    /// communication ticks per second, clamped to 1..=200
    pub fn set_comms_tick(&self, frequency: f64) {
        self.core.frequency_bits.store(clamp_frequency(frequency).to_bits(), Ordering::Release);
    }

    /// Sets the outbox limit, and stops warning about overflows: the application knows it may
    ///  post faster than the connection drains
    pub async fn expect_outbox_overflow(&self, limit: usize) {
        let mut outbox = self.core.outbox.lock().await;
        debug!(old_limit = outbox.limit(), new_limit = limit, "expecting outbox overflow");
        outbox.set_limit(limit);
        drop(outbox);
        self.core.expect_outbox_overflow.store(true, Ordering::Release);
    }

    pub fn counters(&self) -> CommsCounters {
        let counters = &self.core.counters;
        CommsCounters {
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Adds a named queue with its own worker. Mail for the keys routed to it (see
    ///  [MoosCommClient::add_message_route]) goes to `handler` instead of the inbox.
    pub async fn add_active_queue(&self, name: &str, handler: Arc<dyn ActiveMailHandler>) -> bool {
        self.core.router.lock().await
            .add_queue(name, handler)
    }

    /// a queue that claims all mail whose key matches `pattern`
    pub async fn add_wildcard_active_queue(&self, name: &str, pattern: &str, handler: Arc<dyn ActiveMailHandler>) -> bool {
        self.core.router.lock().await
            .add_wildcard_queue(name, pattern, handler)
    }

    pub async fn add_message_route(&self, key: &str, queue: &str) -> bool {
        self.core.router.lock().await
            .add_route(key, queue)
    }

    pub async fn remove_message_route(&self, key: &str, queue: &str) -> bool {
        self.core.router.lock().await
            .remove_route(key, queue)
    }

    pub async fn remove_active_queue(&self, name: &str) -> bool {
        self.core.router.lock().await
            .remove_queue(name)
    }

    /// Starts or stops collecting the broker's per-client comms summaries (`DB_QOS` and
    ///  `DB_RWSUMMARY`) on an active queue of their own. Stopping unregisters both variables.
    pub async fn enable_comms_status_monitoring(&self, enable: bool) -> bool {
        if !enable {
            self.unregister(DB_QOS).await;
            self.unregister(DB_RWSUMMARY).await;
            return self.remove_active_queue(CLIENT_SUMMARIES_QUEUE).await;
        }

        {
            let mut router = self.core.router.lock().await;
            if !router.has_queue(CLIENT_SUMMARIES_QUEUE) {
                let collector = Arc::new(CommsStatusCollector::new(self.core.comms_statuses.clone()));
                router.add_queue(CLIENT_SUMMARIES_QUEUE, collector);
                router.add_route(DB_QOS, CLIENT_SUMMARIES_QUEUE);
                router.add_route(DB_RWSUMMARY, CLIENT_SUMMARIES_QUEUE);
            }
        }
        self.register(DB_QOS, 0.0).await && self.register(DB_RWSUMMARY, 0.0).await
    }

    /// the latest comms status the broker reported for `client`, if monitoring is enabled
    pub async fn client_comms_status(&self, client: &str) -> Option<ClientCommsStatus> {
        self.core.comms_statuses.read().await
            .get(client)
            .cloned()
    }

    /// all known comms statuses, sorted by client name
    pub async fn client_comms_statuses(&self) -> Vec<ClientCommsStatus> {
        let mut result = self.core.comms_statuses.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Disconnects and stops reconnecting. Active queues finish the mail they already have.
    pub async fn close(&self) {
        let _ = self.core.cancel_sender.send(());
        self.core.router.lock().await.stop_all();
    }
}
