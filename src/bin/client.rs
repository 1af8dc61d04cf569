//! A line-oriented chat client shell. Real frontends embed
//! `capchat::client::session` behind their own UI; this one drives it from
//! stdin for development and demos.

use capchat::address::Address;
use capchat::client::id::Identity;
use capchat::client::session::{ClientOutput, ClientSession};
use capchat::client::store::{ContactStore, FileStore};
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "client", version, about = "capchat client shell")]
struct ClientConfig {
    #[arg(long, env = "CHAT_URL", default_value = "ws://localhost:3000/connect")]
    url: String,

    #[arg(long, env = "CHAT_DATA_PATH", default_value = "data/client")]
    data_path: PathBuf,

    /// Display name announced to the CAP on first boot.
    #[arg(long, env = "CHAT_NAME", default_value = "Anonymous")]
    name: String,
}

/// Prints session events straight to the terminal.
struct StdoutOutput;

impl ClientOutput for StdoutOutput {
    fn write_text(&self, id: &str, msg: &str) {
        println!("[{id}] {msg}");
    }

    fn update_contact(&self, id: &str, name: &str) {
        println!("*** new contact: {name} ({id})");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = match ClientConfig::try_parse() {
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
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(config: ClientConfig) -> capchat::Result<()> {
    let identity = Identity::load_or_create(&config.data_path)?;
    println!("account: {}", identity.account_id());

    let store = Arc::new(FileStore::new(
        &config.data_path,
        identity.account_id(),
        &config.name,
    )?);

    let session = Arc::new(ClientSession::new(
        identity,
        store.clone(),
        Arc::new(StdoutOutput),
        &config.url,
    ));

    session.clone().connect().await?;
    println!("connected to {}", config.url);
    println!("commands: contacts | add <address> <name> | send <address> <message> | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');

        match parts.next() {
            Some("quit") => break,

            Some("contacts") => {
                for contact in store.contacts() {
                    println!("{}  {}", contact.id, contact.name);
                }
            }

            Some("add") => match (parts.next(), parts.next()) {
                (Some(addr), Some(name)) => match addr.parse::<Address>() {
                    Ok(id) => {
                        if let Err(err) = store.insert_contact(id, name) {
                            println!("add contact: {err}");
                        }
                    }
                    Err(err) => println!("{err}"),
                },
                _ => println!("usage: add <address> <name>"),
            },

            Some("send") => match (parts.next(), parts.next()) {
                (Some(addr), Some(msg)) => match addr.parse::<Address>() {
                    Ok(to) => {
                        if let Err(err) = session.send_message(to, msg).await {
                            println!("send: {err}");
                        }
                    }
                    Err(err) => println!("{err}"),
                },
                _ => println!("usage: send <address> <message>"),
            },

            Some("") | None => {}

            Some(other) => println!("unknown command: {other}"),
        }
    }

    session.close().await;
    Ok(())
}
