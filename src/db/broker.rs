use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::comms::message::Message;
use crate::db::db_config::DbConfig;
use crate::db::moos_db::MoosDb;
use crate::runtime_context::RuntimeContext;
use crate::server::broker_callbacks::BrokerCallbacks;
use crate::server::comm_server::CommServer;
use crate::server::server_config::ServerConfig;

/// The broker as the comm server sees it. Every callback holds the database lock for the whole
///  packet, so packets are applied one at a time.
pub struct Broker {
    config: Arc<DbConfig>,
    runtime: Arc<RuntimeContext>,
    db: Mutex<MoosDb>,
}

impl Broker {
    pub fn new(config: Arc<DbConfig>, runtime: Arc<RuntimeContext>) -> Broker {
        Broker {
            db: Mutex::new(MoosDb::new(config.clone(), runtime.clone())),
            config,
            runtime,
        }
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// read access to the tables, e.g. for diagnostics
    pub async fn inspect<R>(&self, f: impl FnOnce(&MoosDb) -> R) -> R {
        f(&*self.db.lock().await)
    }

    /// Starts a comm server with this broker behind it, plus the housekeeping tick that keeps the
    ///  DB_* variables fresh while no client sends anything. Both stop when the returned server
    ///  is shut down.
    pub async fn serve(self: Arc<Self>, server_config: Arc<ServerConfig>) -> anyhow::Result<CommServer> {
        let server = CommServer::start(server_config, self.runtime.clone(), self.clone()).await?;
        info!(name = %self.config.name, community = %self.config.community, addr = %server.local_addr(), "broker started");

        tokio::spawn(self.run_housekeeping(server.subscribe_shutdown()));
        Ok(server)
    }

    pub async fn run_housekeeping(self: Arc<Self>, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = interval(self.config.summary_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {
                    self.db.lock().await
                        .maybe_publish_housekeeping();
                }
                _ = cancel.recv() => break,
            }
        }
        debug!("housekeeping terminated");
    }
}

#[async_trait]
impl BrokerCallbacks for Broker {
    async fn on_rx(&self, client: &str, messages: Vec<Message>) -> Vec<Message> {
        self.db.lock().await
            .process_packet(client, messages)
    }

    async fn fetch_all_mail(&self, client: &str) -> Vec<Message> {
        self.db.lock().await
            .fetch_all_mail(client)
    }

    async fn on_connect(&self, client: &str) {
        self.db.lock().await
            .on_connect(client);
    }

    async fn on_disconnect(&self, client: &str) {
        self.db.lock().await
            .on_disconnect(client);
    }
}
