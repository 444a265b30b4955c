mod hub;
mod upstream;

use clap::Parser;
use hub::HubHandles;
use std::{error::Error, net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use upstream::Upstream;

/// One snapshot in flight per consumer; slow consumers skip updates.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 1;
const COMMAND_QUEUE_CAPACITY: usize = 16;
const REGISTRATION_QUEUE_CAPACITY: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "hamon-relay")]
struct Args {
    /// Stats socket: a Unix socket path or host:port.
    upstream: String,
    #[arg(long, default_value = "0.0.0.0:8081")]
    listen: String,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.debug);

    let listen: SocketAddr = match args.listen.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_listen_addr", addr = %args.listen, error = %err);
            return Err(err.into());
        }
    };
    let listener = TcpListener::bind(listen).await?;
    let upstream = Upstream::parse(&args.upstream);
    info!(event = "relay_start", listen = %listen, upstream = %upstream);

    let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (registration_tx, registration_rx) = mpsc::channel(REGISTRATION_QUEUE_CAPACITY);

    tokio::spawn(upstream::run_upstream(
        upstream,
        Duration::from_millis(args.interval_ms),
        command_rx,
        snapshot_tx,
    ));
    tokio::spawn(hub::fan_out(snapshot_rx, registration_rx));
    let accept = tokio::spawn(hub::accept_loop(
        listener,
        HubHandles {
            registrations: registration_tx,
            commands: command_tx,
            queue_capacity: SUBSCRIBER_QUEUE_CAPACITY,
        },
    ));

    let _ = tokio::signal::ctrl_c().await;
    accept.abort();
    info!(event = "relay_stop");
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
