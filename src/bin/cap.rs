use capchat::config::CapConfig;
use capchat::networking::bus::{self, JetStreamBus};
use capchat::networking::chat::{Chat, ChatConfig};
use capchat::networking::registry::UserRegistry;
use capchat::networking::server;
use clap::error::ErrorKind;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match CapConfig::try_parse() {
        Ok(config) => config,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            std::process::exit(0);
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        error!(error = %err, "startup");
        std::process::exit(1);
    }
}

async fn run(config: CapConfig) -> capchat::Result<()> {
    info!(?config, "starting service");

    let cap_id = bus::load_or_create_cap_id(&config.nats_id_file_path)?;
    info!(%cap_id, "cap identity");

    let bus = JetStreamBus::connect(&config.nats_host, &config.nats_subject, cap_id).await?;

    let chat = Chat::start(
        Arc::new(UserRegistry::new()),
        Arc::new(bus),
        cap_id,
        ChatConfig {
            handshake_timeout: config.web_handshake_timeout,
            ..Default::default()
        },
    );

    server::run(&config, chat).await?;

    info!("shutdown complete");
    Ok(())
}
