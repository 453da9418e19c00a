use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

use moos::db::broker::Broker;
use moos::db::db_config::{DbConfig, DEFAULT_COMMUNITY};
use moos::runtime_context::RuntimeContext;
use moos::server::server_config::{ServerConfig, DEFAULT_MOOS_SERVER_PORT};

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = DEFAULT_MOOS_SERVER_PORT)]
    port: u16,

    #[clap(short, long, default_value = DEFAULT_COMMUNITY)]
    community: String,

    /// seconds a client may stay silent before it is disconnected
    #[clap(long, default_value_t = 5.0)]
    client_timeout: f64,

    #[clap(long, default_value_t = 1.0)]
    time_warp: f64,

    #[clap(long, default_value_t = false)]
    single_threaded_clients: bool,

    #[clap(short, long, default_value_t = false)]
    quiet: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let runtime = Arc::new(RuntimeContext::new().with_time_warp(args.time_warp)?);

    let mut db_config = DbConfig::new(&args.community);
    db_config.quiet = args.quiet;
    let broker = Arc::new(Broker::new(Arc::new(db_config), runtime));

    let listen_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let mut server_config = ServerConfig::new(listen_addr, &args.community)
        .with_client_timeout_secs(args.client_timeout)?;
    server_config.support_async = !args.single_threaded_clients;

    let server = broker.serve(Arc::new(server_config)).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown();
    Ok(())
}
