use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{error, info};

use porthole::cli::{Cli, Command, HostArgs, ShareArgs};
use porthole::config::Config;
use porthole::renderer::echo::EchoRendererFactory;
use porthole::session::registry::SessionRegistry;
use porthole::session::server::build_router;
use porthole::session::NoHooks;
use porthole::telemetry::logging;
use porthole::tunnel::{install_signal_handlers, TunnelClient, TunnelConfig, TunnelEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;
    let config = Config::from_env();

    match cli.command {
        Command::Host(args) => run_host(args, config).await,
        Command::Share(args) => run_share(args, config).await,
    }
}

async fn run_host(args: HostArgs, config: Config) -> Result<()> {
    let session_config = args.terminal.to_session_config(&config);
    let listen = args.listen.unwrap_or(config.listen);

    let registry = SessionRegistry::new(
        Arc::new(EchoRendererFactory),
        Arc::new(NoHooks),
        session_config,
    );
    let router = build_router(registry);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "serving multiplexer endpoint");
    println!("viewers connect to ws://{listen}/multiplexer?namespace=<ns>&id=<id>");

    axum::serve(listener, router)
        .await
        .context("server terminated")
}

async fn run_share(args: ShareArgs, config: Config) -> Result<()> {
    let id = args.id.unwrap_or_else(random_tunnel_id);
    let tunnel_config = TunnelConfig {
        relay_url: args.relay,
        id,
        namespace: args.namespace,
        session: args.terminal.to_session_config(&config),
    };

    let (client, mut events) = TunnelClient::connect(
        tunnel_config,
        &EchoRendererFactory,
        Arc::new(NoHooks),
    )
    .await
    .context("failed to establish tunnel")?;

    println!("sharing at {}", client.share_url());
    install_signal_handlers(&client);

    while let Some(event) = events.recv().await {
        match event {
            TunnelEvent::Connected => info!("tunnel connected"),
            TunnelEvent::Error(err) => error!(%err, "tunnel error"),
            TunnelEvent::Disconnected => {
                info!("tunnel disconnected");
                break;
            }
        }
    }
    client.closed().await;
    Ok(())
}

fn random_tunnel_id() -> String {
    let words = [
        "brass", "cabin", "delta", "ember", "fjord", "gale", "harbor", "inlet", "keel", "lagoon",
    ];
    let mut rng = rand::thread_rng();
    let word = words.choose(&mut rng).expect("word list is non-empty");
    let num: u16 = rng.gen_range(100..999);
    format!("{word}-{num}")
}
