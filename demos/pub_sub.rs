use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, Level};

use moos::client::active_queue::ActiveMailHandler;
use moos::client::client_config::{ClientConfig, ClientMode};
use moos::client::comm_client::MoosCommClient;
use moos::comms::message::Message;
use moos::db::broker::Broker;
use moos::db::db_config::DbConfig;
use moos::runtime_context::RuntimeContext;
use moos::server::server_config::ServerConfig;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        // .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

struct PrintingHandler;

#[async_trait]
impl ActiveMailHandler for PrintingHandler {
    async fn on_message(&self, msg: Message) {
        info!("active queue got {}", msg);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let runtime = Arc::new(RuntimeContext::new());
    let broker = Arc::new(Broker::new(Arc::new(DbConfig::new("#demo")), runtime.clone()));
    let server = broker.serve(Arc::new(ServerConfig::new("127.0.0.1:0".parse()?, "#demo"))).await?;
    let addr = server.local_addr().to_string();

    let publisher = MoosCommClient::start(Arc::new(ClientConfig::new(&addr, "publisher")), runtime.clone());

    let mut subscriber_config = ClientConfig::new(&addr, "subscriber");
    subscriber_config.mode = ClientMode::Asynchronous;
    let subscriber = MoosCommClient::start(Arc::new(subscriber_config), runtime.clone());

    publisher.wait_until_connected(Duration::from_secs(5)).await;
    subscriber.wait_until_connected(Duration::from_secs(5)).await;

    subscriber.register("DEPTH", 0.0).await;
    subscriber.add_active_queue("status", Arc::new(PrintingHandler)).await;
    subscriber.add_message_route("STATUS", "status").await;
    subscriber.register("STATUS", 0.0).await;

    for i in 0..10 {
        publisher.notify_double("DEPTH", 10.0 + i as f64 * 0.5, None).await;
        publisher.notify_string("STATUS", &format!("dive step {}", i), Some("demo")).await;
        sleep(Duration::from_millis(300)).await;

        for msg in subscriber.fetch().await {
            info!("fetched {}", msg);
        }
    }

    for msg in publisher.server_request("PROC_SUMMARY", Duration::from_secs(2)).await? {
        info!("{}", msg.string_value());
    }

    publisher.close().await;
    subscriber.close().await;
    server.shutdown();
    Ok(())
}
