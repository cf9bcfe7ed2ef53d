use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;

use porthole_relay::config::Config;
use porthole_relay::state::RelayState;
use porthole_relay::tunnel::build_router;

#[derive(Parser, Debug)]
#[command(
    name = "porthole-relay",
    about = "Rendezvous relay fanning porthole tunnel streams out to public viewers",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "PORTHOLE_RELAY_LISTEN",
        help = "Address to serve on (default 0.0.0.0:8080)"
    )]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let listen = cli.listen.unwrap_or(config.listen);

    let state = RelayState::new(config.upstream_timeout);
    state.start_sweeper(config.sweep_period);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "relay listening");

    axum::serve(listener, router)
        .await
        .context("relay terminated")
}
