mod config;
mod error;
mod extension;
mod launch;
mod pending;
mod protocol;
mod relay;
mod server;

use std::sync::Arc;

use clap::Parser;
use config::RelayArgs;
use relay::Relay;
use server::{EndpointPaths, LaunchConfig, RelayServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = RelayArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(args.tracing_level()))
        .init();

    let browser_channel = match args.browser_channel() {
        Ok(channel) => channel,
        Err(err) => {
            error!("invalid --browser-channel: {err}");
            return Err(err.into());
        }
    };

    info!("Starting cdp-relay server");
    info!("Host: {}", args.host);
    info!("Port: {}", args.port);
    info!("Log level: {}", args.log_level);

    let relay = Arc::new(Relay::new());
    let paths = EndpointPaths::new();
    let launch_config = LaunchConfig {
        browser_channel,
        extension_id: std::env::var("CDP_RELAY_EXTENSION_ID")
            .unwrap_or_else(|_| "cdp-relay-extension".to_string()),
    };

    info!("Client path: {}", paths.client_path);
    info!("Extension path: {}", paths.extension_path);

    let server = Arc::new(RelayServer::new(
        relay,
        paths,
        args.host.clone(),
        args.port,
        Some(launch_config),
    ));

    let listener = server.bind().await?;
    let serve_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    // This binary is its own "external tool layer" (spec §4.3.5): it calls
    // the pre-connect hook itself, once the listener is up but before it
    // connects the upstream CDP client this process exists to serve.
    server.ensure_extension_for_client("cdp-relay-cli").await;

    if let Err(e) = serve_task.await.expect("serve task panicked") {
        error!("relay server error: {}", e);
        return Err(e.into());
    }

    info!("cdp-relay server shutting down");
    Ok(())
}
