use crate::address::Address;
use crate::crypto;
use crate::error::{Error, Result};
use crate::networking::bus::MessageBus;
use crate::networking::registry::{FrameSender, Recipient, User, UserRegistry};
use crate::networking::wire::{BusMessage, HandshakeIdentity, OutMessage, OutUser, SignedMessage};
use futures::stream::SplitStream;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

/// Router tunables. `max_wait` is both the ping cadence and the liveness
/// window: a user whose last ping has gone unanswered longer than this is
/// evicted.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub handshake_timeout: Duration,
    pub max_wait: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            handshake_timeout: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// The CAP router: per-connection handshake and read pump, local dispatch,
/// cross-CAP fan-out over the bus, and the liveness ticker.
pub struct Chat {
    registry: Arc<UserRegistry>,
    bus: Arc<dyn MessageBus>,
    cap_id: Uuid,
    config: ChatConfig,
}

impl Chat {
    /// Creates a router without spawning its background loops.
    pub fn new(
        registry: Arc<UserRegistry>,
        bus: Arc<dyn MessageBus>,
        cap_id: Uuid,
        config: ChatConfig,
    ) -> Arc<Chat> {
        Arc::new(Chat {
            registry,
            bus,
            cap_id,
            config,
        })
    }

    /// Creates a router and spawns the bus-consume pump and liveness ticker.
    pub fn start(
        registry: Arc<UserRegistry>,
        bus: Arc<dyn MessageBus>,
        cap_id: Uuid,
        config: ChatConfig,
    ) -> Arc<Chat> {
        let chat = Chat::new(registry, bus, cap_id, config);

        let consumer = chat.clone();
        tokio::spawn(
            consumer
                .consume_bus()
                .instrument(info_span!("bus", trace_id = %Uuid::new_v4())),
        );

        let pinger = chat.clone();
        tokio::spawn(
            pinger
                .run_liveness()
                .instrument(info_span!("liveness", trace_id = %Uuid::new_v4())),
        );

        chat
    }

    pub fn cap_id(&self) -> Uuid {
        self.cap_id
    }

    /// Drives one upgraded connection: handshake, then the read pump until a
    /// critical error, cancellation, or disconnect.
    pub async fn connect(self: Arc<Self>, ws: WebSocket) {
        let (ws_tx, mut ws_rx) = ws.split();

        // All writes to this socket, text and control frames alike, are
        // funneled through one queue so they serialize on a single task.
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn(UnboundedReceiverStream::new(rx).forward(ws_tx).map(
            |result: std::result::Result<(), warp::Error>| {
                if let Err(err) = result {
                    debug!(error = %err, "write forward ended");
                }
            },
        ));

        let cancel = Arc::new(Notify::new());

        let (user_id, user_name) = match self.handshake(&tx, &mut ws_rx, cancel.clone()).await {
            Ok(user) => user,
            Err(err) => {
                info!(error = %err, "handshake failed");
                let _ = tx.send(Ok(Message::close()));
                return;
            }
        };

        info!(id = %user_id, name = %user_name, "handshake complete");

        self.listen(user_id, &user_name, &mut ws_rx, cancel).await;
        self.registry.remove(user_id).await;
    }

    /// The connect protocol: send `HELLO`, read the identity frame within the
    /// deadline, register, reply `WELCOME <name>`. A duplicate identity gets
    /// `Already Connected` and a close.
    async fn handshake(
        &self,
        tx: &FrameSender,
        ws_rx: &mut SplitStream<WebSocket>,
        cancel: Arc<Notify>,
    ) -> Result<(Address, String)> {
        tx.send(Ok(Message::text("HELLO")))
            .map_err(|_| Error::ConnectionClosed)?;

        let frame = tokio::time::timeout(self.config.handshake_timeout, ws_rx.next())
            .await
            .map_err(|_| Error::HandshakeFailed("deadline exceeded".into()))?
            .ok_or_else(|| Error::HandshakeFailed("connection closed".into()))?
            .map_err(|err| Error::HandshakeFailed(format!("read: {err}")))?;

        let text = frame
            .to_str()
            .map_err(|_| Error::HandshakeFailed("expected text frame".into()))?;

        let identity: HandshakeIdentity = serde_json::from_str(text)
            .map_err(|err| Error::HandshakeFailed(format!("unmarshal: {err}")))?;

        let user = User::new(identity.id, identity.name.clone(), tx.clone(), cancel);
        if let Err(err) = self.registry.add(user).await {
            // The caller closes the socket after the refusal.
            let _ = tx.send(Ok(Message::text("Already Connected")));
            return Err(err);
        }

        let welcome = format!("WELCOME {}", identity.name);
        if tx.send(Ok(Message::text(welcome))).is_err() {
            self.registry.remove(identity.id).await;
            return Err(Error::ConnectionClosed);
        }

        Ok((identity.id, identity.name))
    }

    /// The per-user read pump. Pong frames feed liveness; text frames are
    /// dispatched. Malformed input is logged and skipped; only a read error,
    /// a close, or cancellation ends the loop.
    async fn listen(
        &self,
        from_id: Address,
        from_name: &str,
        ws_rx: &mut SplitStream<WebSocket>,
        cancel: Arc<Notify>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = ws_rx.next() => frame,
                _ = cancel.notified() => {
                    info!(id = %from_id, "read canceled");
                    return;
                }
            };

            let frame = match frame {
                None => {
                    info!(id = %from_id, "client disconnected");
                    return;
                }
                Some(Err(err)) => {
                    info!(id = %from_id, error = %err, "client disconnected");
                    return;
                }
                Some(Ok(frame)) => frame,
            };

            if frame.is_pong() {
                if let Err(err) = self.registry.update_last_pong(from_id).await {
                    debug!(id = %from_id, error = %err, "pong");
                }
                continue;
            }

            if frame.is_close() {
                info!(id = %from_id, "client closed");
                return;
            }

            let Ok(text) = frame.to_str() else {
                continue;
            };

            let message: SignedMessage = match serde_json::from_str(text) {
                Err(err) => {
                    info!(error = %err, "loc-unmarshal");
                    continue;
                }
                Ok(message) => message,
            };

            info!(from = %from_id, to = %message.to_id, "LOC: msg recv");

            self.dispatch(from_id, from_name, message).await;
        }
    }

    /// Routes one authenticated message: local delivery on a registry hit,
    /// bus escalation on a miss.
    async fn dispatch(&self, from_id: Address, from_name: &str, message: SignedMessage) {
        if !verify_sender(&message.signed_payload(), &message.sig, from_id) {
            return;
        }

        match self.registry.retrieve(message.to_id).await {
            Ok(recipient) => match deliver(&recipient, from_id, from_name, &message) {
                Ok(()) => info!(from = %from_id, to = %message.to_id, "LOC: msg sent"),
                Err(err) => info!(error = %err, "loc-send"),
            },

            Err(Error::NotExists) => {
                info!(to = %message.to_id, "user not found, sending over bus");
                if let Err(err) = self.publish_bus(from_id, from_name, message).await {
                    info!(error = %err, "loc-bussend");
                }
            }

            Err(err) => info!(error = %err, "loc-retrieve"),
        }
    }

    async fn publish_bus(
        &self,
        from_id: Address,
        from_name: &str,
        message: SignedMessage,
    ) -> Result<()> {
        let envelope = BusMessage {
            cap_id: self.cap_id,
            from_id,
            from_name: from_name.to_string(),
            to_id: message.to_id,
            msg: message.msg,
            from_nonce: message.from_nonce,
            sig: message.sig,
        };

        let data = serde_json::to_vec(&envelope)
            .map_err(|err| Error::Malformed(format!("bus marshal: {err}")))?;

        self.bus.publish(data).await
    }

    /// The bus pump: pull, ack, parse, drop own publications, deliver to
    /// local recipients. Only critical bus errors end the loop.
    async fn consume_bus(self: Arc<Self>) {
        loop {
            let payload = match self.bus.next().await {
                Err(err) if err.is_critical() => {
                    info!(error = %err, "bus consume terminated");
                    return;
                }
                Err(err) => {
                    info!(error = %err, "bus-read");
                    continue;
                }
                Ok(payload) => payload,
            };

            let envelope: BusMessage = match serde_json::from_slice(&payload) {
                Err(err) => {
                    info!(error = %err, "bus-unmarshal");
                    continue;
                }
                Ok(envelope) => envelope,
            };

            // Never loop our own publications back to ourselves.
            if envelope.cap_id == self.cap_id {
                continue;
            }

            info!(from = %envelope.from_id, to = %envelope.to_id, "BUS: msg recv");

            if !verify_sender(&envelope.signed_payload(), &envelope.sig, envelope.from_id) {
                continue;
            }

            match self.registry.retrieve(envelope.to_id).await {
                Ok(recipient) => {
                    let message = SignedMessage {
                        to_id: envelope.to_id,
                        msg: envelope.msg.clone(),
                        from_nonce: envelope.from_nonce,
                        sig: envelope.sig,
                    };
                    match deliver(&recipient, envelope.from_id, &envelope.from_name, &message) {
                        Ok(()) => {
                            info!(from = %envelope.from_id, to = %envelope.to_id, "BUS: msg sent")
                        }
                        Err(err) => info!(error = %err, "bus-send"),
                    }
                }

                // The owning CAP will see it on its own subscription.
                Err(Error::NotExists) => debug!(to = %envelope.to_id, "bus-retrieve: user not found"),

                Err(err) => info!(error = %err, "bus-retrieve"),
            }
        }
    }

    async fn run_liveness(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.max_wait);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.sweep_liveness().await;
        }
    }

    /// One liveness pass over a registry snapshot: evict users whose last
    /// ping went unanswered beyond the window, ping everyone else.
    pub async fn sweep_liveness(&self) {
        for (id, conn) in self.registry.connections().await {
            let unanswered = conn.last_ping.saturating_duration_since(conn.last_pong);
            if unanswered > self.config.max_wait {
                info!(%id, ?unanswered, "no pong within liveness window, evicting");
                self.registry.remove(id).await;
                continue;
            }

            if conn.conn.send(Ok(Message::ping("ping"))).is_err() {
                info!(%id, "ping write failed");
            }

            if let Err(err) = self.registry.update_last_ping(id).await {
                debug!(%id, error = %err, "update ping");
            }
        }
    }
}

/// Checks the signature triple against the announced sender, logging and
/// rejecting on mismatch or recovery failure.
fn verify_sender(
    payload: &crypto::SignedPayload,
    sig: &crypto::Signature,
    from_id: Address,
) -> bool {
    match crypto::recover_address(payload, sig) {
        Ok(signer) if signer == from_id => true,
        Ok(signer) => {
            info!(%from_id, %signer, "dropping message: signer mismatch");
            false
        }
        Err(err) => {
            info!(%from_id, error = %err, "dropping message: invalid signature");
            false
        }
    }
}

/// Writes a delivered message onto the recipient's connection.
fn deliver(
    recipient: &Recipient,
    from_id: Address,
    from_name: &str,
    message: &SignedMessage,
) -> Result<()> {
    let out = OutMessage {
        from: OutUser {
            id: from_id,
            name: from_name.to_string(),
            nonce: message.from_nonce,
        },
        msg: message.msg.clone(),
    };

    let data =
        serde_json::to_string(&out).map_err(|err| Error::Malformed(format!("marshal: {err}")))?;

    recipient
        .conn
        .send(Ok(Message::text(data)))
        .map_err(|_| Error::ConnectionClosed)
}
