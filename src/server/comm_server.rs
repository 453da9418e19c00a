use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn, Instrument, Span};

use crate::comms::message::{Message, MessageType};
use crate::comms::packet::Packet;
use crate::comms::protocol::{check_protocol_token, duplicate_name_reason, HandshakeRequest, HandshakeResponse, Welcome};
use crate::comms::transport::{listen, Connection, PacketReader, PacketWriter};
use crate::error::MoosError;
use crate::runtime_context::RuntimeContext;
use crate::server::broker_callbacks::BrokerCallbacks;
use crate::server::server_config::ServerConfig;


/// Handle to a running comm server. The server's tasks run until [CommServer::shutdown] is
///  called or the handle is dropped.
pub struct CommServer {
    local_addr: SocketAddr,
    clients: Arc<RwLock<FxHashMap<String, ClientSession>>>,
    cancel_sender: broadcast::Sender<()>,
}

struct ClientSession {
    /// distinguishes this connection from earlier ones that used the same name
    generation: u64,
    is_async: bool,
    peer_addr: SocketAddr,
    last_activity: Instant,
    outbound: mpsc::UnboundedSender<Packet>,
    cancel_sender: broadcast::Sender<()>,
}

enum ServerEvent {
    Connected { client: String },
    Packet { client: String, generation: u64, packet: Packet },
    Closed { client: String, generation: u64, reason: String },
    Silent { client: String, generation: u64 },
}

struct ServerShared {
    config: Arc<ServerConfig>,
    runtime: Arc<RuntimeContext>,
    callbacks: Arc<dyn BrokerCallbacks>,
    clients: Arc<RwLock<FxHashMap<String, ClientSession>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    next_generation: AtomicU64,
    cancel_sender: broadcast::Sender<()>,
}

impl CommServer {
    /// Binds the listen socket and spawns the accept, dispatch and eviction tasks. Failing to
    ///  bind is the only error reported here, everything after that is handled per connection.
    pub async fn start(config: Arc<ServerConfig>, runtime: Arc<RuntimeContext>, callbacks: Arc<dyn BrokerCallbacks>) -> anyhow::Result<CommServer> {
        let listener = listen(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let (cancel_sender, _) = broadcast::channel(1);
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let clients = Arc::new(RwLock::new(FxHashMap::default()));

        let shared = Arc::new(ServerShared {
            config: config.clone(),
            runtime,
            callbacks,
            clients: clients.clone(),
            events: event_sender,
            next_generation: AtomicU64::new(0),
            cancel_sender: cancel_sender.clone(),
        });

        info!(addr = %local_addr, community = %config.community, "comm server listening");

        // subscribe before spawning so that an immediate shutdown is not missed
        tokio::spawn(accept_loop(listener, shared.clone(), cancel_sender.subscribe()));
        tokio::spawn(dispatch_loop(event_receiver, shared.clone(), cancel_sender.subscribe()));
        tokio::spawn(eviction_loop(shared, cancel_sender.subscribe()));

        Ok(CommServer {
            local_addr,
            clients,
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn client_names(&self) -> Vec<String> {
        let mut result = self.clients.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn is_client_connected(&self, name: &str) -> bool {
        self.clients.read().await
            .contains_key(name)
    }

    /// lets companion tasks stop together with the server
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.cancel_sender.subscribe()
    }

    pub fn shutdown(&self) {
        debug!("shutting down comm server");
        let _ = self.cancel_sender.send(());
    }
}

impl Drop for CommServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, mut cancel: broadcast::Receiver<()>) {
    loop {
        select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(addr, stream, shared).await {
                            warn!("connection from {} broke with an error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            },
            _ = cancel.recv() => break,
        }
    }
    debug!("accept loop terminated");
}

#[instrument(name="client_connection", skip_all, fields(addr = %addr))]
async fn handle_connection(addr: SocketAddr, stream: TcpStream, shared: Arc<ServerShared>) -> anyhow::Result<()> {
    debug!("accepted connection");
    let mut server_cancel = shared.cancel_sender.subscribe();
    let config = shared.config.clone();
    let mut connection = Connection::new(stream, config.max_packet_size, config.disable_nagle)?;

    let token = connection.reader.read_protocol_token(config.handshake_timeout).await?;
    if let Err(e) = check_protocol_token(&token) {
        connection.writer.shutdown().await;
        return Err(e);
    }

    let request = HandshakeRequest::from_message(&connection.reader.read_message(config.handshake_timeout).await?)?;
    let client = request.name.clone();
    let is_async = request.asynchronous && config.support_async;

    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
    let (session_cancel, mut reader_cancel) = broadcast::channel(1);
    let writer_cancel = session_cancel.subscribe();
    let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);

    let registered = match shared.clients.write().await.entry(client.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(e) => {
            e.insert(ClientSession {
                generation,
                is_async,
                peer_addr: addr,
                last_activity: Instant::now(),
                outbound: outbound_sender,
                cancel_sender: session_cancel,
            });
            true
        }
    };
    if !registered {
        warn!(client = %client, "rejecting connection: name is already in use");
        let poison = HandshakeResponse::Poison(duplicate_name_reason(&client));
        let _ = connection.writer.write_message(&poison.to_message()).await;
        connection.writer.shutdown().await;
        return Err(MoosError::DuplicateClientName(client).into());
    }

    let welcome = HandshakeResponse::Welcome(Welcome {
        skew: shared.runtime.local_time() - request.client_time,
        server_is_asynchronous: config.support_async,
        server_hostname: connection.local_addr.ip().to_string(),
        community: config.community.clone(),
    });
    if let Err(e) = connection.writer.write_message(&welcome.to_message()).await {
        shared.remove_session(&client, generation).await;
        return Err(e);
    }

    info!(client = %client, is_async, "client connected");
    let _ = shared.events.send(ServerEvent::Connected { client: client.clone() });

    let Connection { reader, writer, .. } = connection;
    tokio::spawn(write_loop(writer, outbound_receiver, writer_cancel, shared.cancel_sender.subscribe())
        .instrument(Span::current()));

    let reason = select! {
        reason = read_loop(reader, &client, generation, &shared.events) => reason,
        _ = reader_cancel.recv() => "disconnected by server".to_string(),
        _ = server_cancel.recv() => "server shut down".to_string(),
    };

    debug!(client = %client, reason = %reason, "connection closed");
    let _ = shared.events.send(ServerEvent::Closed { client, generation, reason });
    Ok(())
}

async fn read_loop(mut reader: PacketReader, client: &str, generation: u64, events: &mpsc::UnboundedSender<ServerEvent>) -> String {
    loop {
        match reader.read_packet().await {
            Ok(packet) => {
                trace!(client, num_messages = packet.messages.len(), "received packet");
                let event = ServerEvent::Packet { client: client.to_string(), generation, packet };
                if events.send(event).is_err() {
                    return "server shut down".to_string();
                }
            }
            Err(e) => return e.to_string(),
        }
    }
}

async fn write_loop(mut writer: PacketWriter, mut outbound: mpsc::UnboundedReceiver<Packet>, mut cancel: broadcast::Receiver<()>, mut server_cancel: broadcast::Receiver<()>) {
    loop {
        select! {
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = writer.write_packet(&packet).await {
                        debug!("error writing to client: {}", e);
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.recv() => break,
            _ = server_cancel.recv() => break,
        }
    }
    writer.shutdown().await;
}

/// All broker callbacks are made from here, so the broker sees client events strictly in order
async fn dispatch_loop(mut events: mpsc::UnboundedReceiver<ServerEvent>, shared: Arc<ServerShared>, mut cancel: broadcast::Receiver<()>) {
    loop {
        let event = select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.recv() => break,
        };

        match event {
            ServerEvent::Connected { client } => {
                shared.callbacks.on_connect(&client).await;
            }
            ServerEvent::Packet { client, generation, packet } => {
                shared.process_packet(&client, generation, packet).await;
            }
            ServerEvent::Closed { client, generation, reason } => {
                shared.disconnect(&client, generation, &reason).await;
            }
            ServerEvent::Silent { client, generation } => {
                let reason = MoosError::ClientSilence(client.clone()).to_string();
                shared.disconnect(&client, generation, &reason).await;
            }
        }
    }
    debug!("dispatch loop terminated");
}

async fn eviction_loop(shared: Arc<ServerShared>, mut cancel: broadcast::Receiver<()>) {
    let mut ticks = interval(shared.config.timeout_check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {}
            _ = cancel.recv() => break,
        }

        let now = Instant::now();
        let silent = shared.clients.read().await
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > shared.config.client_timeout)
            .map(|(name, s)| (name.clone(), s.generation))
            .collect::<Vec<_>>();

        for (client, generation) in silent {
            warn!(client = %client, "client has been silent for longer than {:?}", shared.config.client_timeout);
            let _ = shared.events.send(ServerEvent::Silent { client, generation });
        }
    }
}

impl ServerShared {
    async fn process_packet(&self, client: &str, generation: u64, packet: Packet) {
        let outbound = match self.clients.write().await.get_mut(client) {
            Some(session) if session.generation == generation => {
                session.last_activity = Instant::now();
                session.outbound.clone()
            }
            _ => {
                debug!(client, "dropping packet from a connection that is no longer registered");
                return;
            }
        };

        let (timing, messages): (Vec<Message>, Vec<Message>) = packet.into_messages(true)
            .into_iter()
            .partition(|m| m.is_type(MessageType::Timing));
        let contains_notify = messages.iter()
            .any(|m| m.is_type(MessageType::Notify));

        let now = self.runtime.local_time();
        let mut reply = vec![Message::null("", now)];
        reply.extend(timing.iter().map(|t| timing_echo(t, now)));
        reply.extend(self.callbacks.on_rx(client, messages).await);

        // if the writer is gone, the reader reports the closed connection shortly
        let _ = outbound.send(Packet::new(reply));

        if contains_notify {
            self.push_async_mail().await;
        }
    }

    async fn push_async_mail(&self) {
        let targets = self.clients.read().await
            .iter()
            .filter(|(_, s)| s.is_async)
            .map(|(name, s)| (name.clone(), s.outbound.clone()))
            .collect::<Vec<_>>();

        for (client, outbound) in targets {
            let mail = self.callbacks.fetch_all_mail(&client).await;
            if mail.is_empty() {
                continue;
            }
            trace!(client = %client, num_messages = mail.len(), "pushing mail to asynchronous client");

            let mut packet = Vec::with_capacity(mail.len() + 1);
            packet.push(Message::null("", self.runtime.local_time()));
            packet.extend(mail);
            let _ = outbound.send(Packet::new(packet));
        }
    }

    async fn disconnect(&self, client: &str, generation: u64, reason: &str) {
        if let Some(session) = self.remove_session(client, generation).await {
            let _ = session.cancel_sender.send(());
            info!(client, peer = %session.peer_addr, reason, "client disconnected");
            self.callbacks.on_disconnect(client).await;
        }
    }

    async fn remove_session(&self, client: &str, generation: u64) -> Option<ClientSession> {
        let mut clients = self.clients.write().await;
        match clients.get(client) {
            Some(session) if session.generation == generation => clients.remove(client),
            _ => None,
        }
    }
}

/// echoes an asynchronous client's timing probe: its own send time as value, our time as time
fn timing_echo(probe: &Message, now: f64) -> Message {
    Message {
        msg_type: MessageType::Timing,
        key: probe.key.clone(),
        double_value: probe.time,
        time: now,
        ..Default::default()
    }
}
