//! In-process stand-ins for the external collaborators: a broadcast-backed
//! message bus with JetStream's fan-out semantics, a recording UI, and
//! helpers for spinning up CAPs on ephemeral ports.

use crate::client::session::ClientOutput;
use crate::error::{Error, Result};
use crate::networking::bus::MessageBus;
use crate::networking::chat::Chat;
use crate::networking::filters;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// One shared subject. Every [`MemoryBus`] endpoint created from it receives
/// every published message, like independent durable consumers on a stream.
pub struct MemoryBusNetwork {
    tx: broadcast::Sender<Vec<u8>>,
}

impl MemoryBusNetwork {
    pub fn new() -> MemoryBusNetwork {
        let (tx, _) = broadcast::channel(256);
        MemoryBusNetwork { tx }
    }

    pub fn endpoint(&self) -> MemoryBus {
        MemoryBus {
            tx: self.tx.clone(),
            rx: tokio::sync::Mutex::new(self.tx.subscribe()),
        }
    }
}

impl Default for MemoryBusNetwork {
    fn default() -> Self {
        MemoryBusNetwork::new()
    }
}

pub struct MemoryBus {
    tx: broadcast::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
}

impl MemoryBus {
    /// Publishes without surfacing errors, for tests injecting raw traffic.
    pub async fn publish_raw(&self, payload: Vec<u8>) {
        let _ = self.tx.send(payload);
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(payload)
            .map(|_| ())
            .map_err(|_| Error::BusUnavailable("no consumers".into()))
    }

    async fn next(&self) -> Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ConnectionClosed),
            }
        }
    }
}

/// A [`ClientOutput`] that records everything for later assertions.
pub struct RecordingOutput {
    texts: Mutex<Vec<(String, String)>>,
    contacts: Mutex<Vec<(String, String)>>,
}

impl RecordingOutput {
    pub fn new() -> RecordingOutput {
        RecordingOutput {
            texts: Mutex::new(Vec::new()),
            contacts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contact_updates(&self) -> Vec<(String, String)> {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True if any line written under `id` contains `needle`.
    pub fn contains(&self, id: &str, needle: &str) -> bool {
        self.texts()
            .iter()
            .any(|(line_id, msg)| line_id == id && msg.contains(needle))
    }
}

impl Default for RecordingOutput {
    fn default() -> Self {
        RecordingOutput::new()
    }
}

impl ClientOutput for RecordingOutput {
    fn write_text(&self, id: &str, msg: &str) {
        self.texts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.to_string(), msg.to_string()));
    }

    fn update_contact(&self, id: &str, name: &str) {
        self.contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.to_string(), name.to_string()));
    }
}

/// Serves a router on an ephemeral local port and returns its address.
pub async fn spawn_cap(chat: Arc<Chat>) -> SocketAddr {
    let routes = filters::connect_route(chat);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

/// Polls a condition every 10 ms for up to three seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
