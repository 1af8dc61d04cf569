use crate::address::Address;
use crate::client::id::Identity;
use crate::client::store::ContactStore;
use crate::crypto::{self, SignedPayload};
use crate::error::{Error, Result};
use crate::networking::wire::{HandshakeIdentity, OutMessage, SignedMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The narrow capability surface the session needs from the UI.
pub trait ClientOutput: Send + Sync {
    fn write_text(&self, id: &str, msg: &str);
    fn update_contact(&self, id: &str, name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Connected,
    Closed,
}

/// The client session core: dials a CAP, runs the connect handshake, signs
/// outgoing messages, and verifies nonce discipline on incoming ones.
pub struct ClientSession {
    identity: Identity,
    store: Arc<dyn ContactStore>,
    output: Arc<dyn ClientOutput>,
    url: String,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
}

impl ClientSession {
    pub fn new(
        identity: Identity,
        store: Arc<dyn ContactStore>,
        output: Arc<dyn ClientOutput>,
        url: &str,
    ) -> ClientSession {
        ClientSession {
            identity,
            store,
            output,
            url: url.to_string(),
            state: Mutex::new(SessionState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Dials the CAP and runs the three-message connect sequence, then
    /// spawns the receive pump. Only a `Disconnected` or `Closed` session
    /// may connect.
    pub async fn connect(self: Arc<Self>) -> Result<()> {
        match self.state() {
            SessionState::Disconnected | SessionState::Closed => {}
            state => {
                return Err(Error::InvalidArgument(format!(
                    "connect from state {state:?}"
                )))
            }
        }
        self.set_state(SessionState::Handshaking);

        match self.handshake().await {
            Ok(stream) => {
                self.set_state(SessionState::Connected);
                let session = Arc::clone(&self);
                tokio::spawn(async move { session.receive_pump(stream).await });
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<WsStream> {
        url::Url::parse(&self.url)
            .map_err(|err| Error::InvalidArgument(format!("url: {err}")))?;

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| Error::HandshakeFailed(format!("dial: {err}")))?;

        let (mut sink, mut stream) = ws.split();

        let greeting = read_text(&mut stream).await?;
        if greeting != "HELLO" {
            return Err(Error::HandshakeFailed(format!(
                "unexpected greeting: {greeting}"
            )));
        }

        let account = self.store.my_account();
        let identity = HandshakeIdentity {
            id: account.id,
            name: account.name,
        };
        let data = serde_json::to_string(&identity)
            .map_err(|err| Error::Malformed(format!("marshal: {err}")))?;
        sink.send(Message::Text(data))
            .await
            .map_err(|err| Error::HandshakeFailed(format!("write: {err}")))?;

        let reply = read_text(&mut stream).await?;
        if reply == "Already Connected" {
            return Err(Error::AlreadyExists);
        }
        if !reply.starts_with("WELCOME") {
            return Err(Error::HandshakeFailed(format!("unexpected reply: {reply}")));
        }

        *self.writer.lock().await = Some(sink);

        Ok(stream)
    }

    /// Closes the session. The CAP notices on its next read or liveness pass.
    pub async fn close(&self) {
        self.writer.lock().await.take();
        self.set_state(SessionState::Closed);
    }

    /// Signs and transmits one message to a known contact, then records the
    /// used nonce and the formatted history line.
    pub async fn send_message(&self, to: Address, text: &str) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(Error::ConnectionClosed);
        }
        if text.is_empty() {
            return Err(Error::InvalidArgument("empty message".into()));
        }

        let contact = self.store.query_contact_by_id(to)?;
        let text = self.preprocess_outgoing(text)?;

        let nonce = contact.app_last_nonce + 1;
        let payload = SignedPayload {
            to_id: to,
            msg: text.clone(),
            from_nonce: nonce,
        };
        let sig = crypto::sign(&payload, self.identity.keypair().secret_key())?;

        let out = SignedMessage {
            to_id: to,
            msg: text.clone(),
            from_nonce: nonce,
            sig,
        };
        let data = serde_json::to_string(&out)
            .map_err(|err| Error::Malformed(format!("marshal: {err}")))?;

        {
            let mut writer = self.writer.lock().await;
            let sink = writer.as_mut().ok_or(Error::ConnectionClosed)?;
            sink.send(Message::Text(data))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
        }

        // The frame has left the host. A record-keeping failure from here on
        // is drift to surface, not a send failure.
        if let Err(err) = self.store.update_app_nonce(to, nonce) {
            let drift = Error::StateDrift(format!("outbound nonce not recorded: {err}"));
            warn!(%to, error = %drift, "send");
            self.output.write_text("system", &drift.to_string());
        }

        let formatted = format_message("You", &text);
        if let Err(err) = self.store.insert_message(to, &formatted) {
            self.output.write_text("system", &format!("add message: {err}"));
        }
        self.output.write_text(&to.to_hex(), &formatted);

        Ok(())
    }

    /// Rewrites outgoing slash commands. `/share key` becomes the in-band
    /// `/key <PEM>` control message; anything else starting with `/` is
    /// refused.
    fn preprocess_outgoing(&self, text: &str) -> Result<String> {
        let Some(rest) = text.strip_prefix('/') else {
            return Ok(text.to_string());
        };

        if text == "/share key" {
            let pem = self.identity.share_key_pem();
            if pem.is_empty() {
                return Err(Error::NoKey);
            }
            return Ok(format!("/key {pem}"));
        }

        let command = rest.split_whitespace().next().unwrap_or("");
        Err(Error::UnknownCommand(format!("/{command}")))
    }

    /// The receive pump: one task reading frames until the socket dies or
    /// the nonce discipline is violated.
    async fn receive_pump(self: Arc<Self>, mut stream: WsStream) {
        loop {
            let message = match stream.next().await {
                None => {
                    self.output.write_text("system", "read: connection closed");
                    break;
                }
                Some(Err(err)) => {
                    self.output.write_text("system", &format!("read: {err}"));
                    break;
                }
                Some(Ok(message)) => message,
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    self.output.write_text("system", "read: connection closed");
                    break;
                }
                // Ping/pong control frames are answered by the protocol layer.
                _ => continue,
            };

            if !self.handle_incoming(&text) {
                break;
            }
        }

        self.writer.lock().await.take();
        self.set_state(SessionState::Closed);
    }

    /// Processes one delivered message. Returns false when the pump must
    /// terminate.
    fn handle_incoming(&self, text: &str) -> bool {
        let incoming: OutMessage = match serde_json::from_str(text) {
            Err(err) => {
                // Malformed input is dropped, not fatal.
                self.output.write_text("system", &format!("unmarshal: {err}"));
                return true;
            }
            Ok(incoming) => incoming,
        };
        let from = incoming.from;

        let contact = match self.store.query_contact_by_id(from.id) {
            Ok(contact) => contact,
            Err(_) => match self.store.insert_contact(from.id, &from.name) {
                Ok(contact) => {
                    self.output.update_contact(&from.id.to_hex(), &from.name);
                    contact
                }
                Err(err) => {
                    self.output.write_text("system", &format!("add contact: {err}"));
                    return false;
                }
            },
        };

        // Nonce discipline. The bus delivers at least once, so an exact
        // repeat of the last accepted nonce is a redelivery to drop quietly.
        // Anything else off the expected sequence is tampering or desync.
        let expected = contact.last_nonce + 1;
        if from.nonce == contact.last_nonce && contact.last_nonce > 0 {
            debug!(from = %from.id, nonce = from.nonce, "duplicate delivery dropped");
            return true;
        }
        if from.nonce != expected {
            let err = Error::PossibleReplay {
                got: from.nonce,
                expected,
            };
            self.output.write_text(
                "system",
                &format!("SECURITY: {err}: terminating session with contact"),
            );
            return false;
        }

        if let Err(err) = self.store.update_contact_nonce(from.id, expected) {
            self.output
                .write_text("system", &format!("update contact nonce: {err}"));
            return false;
        }

        // In-band control channel.
        if let Some(rest) = incoming.msg.strip_prefix('/') {
            if let Some(pem) = incoming.msg.strip_prefix("/key ") {
                if let Err(err) = self.store.update_contact_key(from.id, pem) {
                    self.output.write_text("system", &format!("update key: {err}"));
                    return false;
                }

                let note = format_message(&contact.name, "** updated contact's key **");
                if let Err(err) = self.store.insert_message(from.id, &note) {
                    self.output.write_text("system", &format!("add message: {err}"));
                    return false;
                }
                self.output.write_text(&from.id.to_hex(), &note);
                return true;
            }

            let command = rest.split_whitespace().next().unwrap_or("");
            self.output
                .write_text("system", &format!("unknown command from contact: /{command}"));
            return false;
        }

        let formatted = format_message(&contact.name, &incoming.msg);
        if let Err(err) = self.store.insert_message(from.id, &formatted) {
            self.output.write_text("system", &format!("add message: {err}"));
            return false;
        }
        self.output.write_text(&from.id.to_hex(), &formatted);

        true
    }
}

async fn read_text(stream: &mut WsStream) -> Result<String> {
    loop {
        match stream.next().await {
            None => return Err(Error::HandshakeFailed("connection closed".into())),
            Some(Err(err)) => return Err(Error::HandshakeFailed(format!("read: {err}"))),
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(_)) => continue,
        }
    }
}

fn format_message(name: &str, msg: &str) -> String {
    format!("{name}: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::FileStore;
    use crate::keypair::Keypair;
    use crate::networking::bus::MessageBus;
    use crate::networking::chat::{Chat, ChatConfig};
    use crate::networking::registry::UserRegistry;
    use crate::networking::wire::BusMessage;
    use crate::test_utilities::mocks::{spawn_cap, wait_until, MemoryBusNetwork, RecordingOutput};
    use std::path::Path;
    use uuid::Uuid;

    const FAKE_PEM: &str = "-----BEGIN PUBLIC KEY-----\nZmFrZSBrZXk=\n-----END PUBLIC KEY-----\n";

    struct TestClient {
        session: Arc<ClientSession>,
        store: Arc<FileStore>,
        output: Arc<RecordingOutput>,
        keypair: Keypair,
    }

    fn build_client(dir: &Path, name: &str, share_pem: &str, url: &str) -> TestClient {
        let keypair = Keypair::generate();
        let store = Arc::new(FileStore::new(dir, keypair.address(), name).unwrap());
        let output = Arc::new(RecordingOutput::new());
        let identity = Identity::from_parts(keypair.clone(), share_pem.to_string());

        let session = Arc::new(ClientSession::new(
            identity,
            store.clone(),
            output.clone(),
            url,
        ));

        TestClient {
            session,
            store,
            output,
            keypair,
        }
    }

    async fn start_cap(network: &MemoryBusNetwork) -> String {
        let chat = Chat::start(
            Arc::new(UserRegistry::new()),
            Arc::new(network.endpoint()),
            Uuid::new_v4(),
            ChatConfig::default(),
        );
        let addr = spawn_cap(chat).await;
        format!("ws://{addr}/connect")
    }

    fn bus_envelope(from: &Keypair, from_name: &str, to: Address, msg: &str, nonce: u64) -> Vec<u8> {
        let payload = SignedPayload {
            to_id: to,
            msg: msg.into(),
            from_nonce: nonce,
        };
        let sig = crypto::sign(&payload, from.secret_key()).unwrap();
        serde_json::to_vec(&BusMessage {
            cap_id: Uuid::new_v4(),
            from_id: from.address(),
            from_name: from_name.into(),
            to_id: to,
            msg: msg.into(),
            from_nonce: nonce,
            sig,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn local_round_trip() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url);
        let bob = build_client(b_dir.path(), "Bob", "", &url);

        alice.session.clone().connect().await.unwrap();
        bob.session.clone().connect().await.unwrap();

        alice
            .store
            .insert_contact(bob.keypair.address(), "Bob")
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "hi")
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(
            wait_until(move || bob_output.contains(&alice_id, "Alice: hi")).await,
            "bob never saw the message"
        );

        // Both sides recorded the nonce durably.
        let contact = bob
            .store
            .query_contact_by_id(alice.keypair.address())
            .unwrap();
        assert_eq!(contact.last_nonce, 1);
        assert_eq!(contact.name, "Alice");

        let contact = alice
            .store
            .query_contact_by_id(bob.keypair.address())
            .unwrap();
        assert_eq!(contact.app_last_nonce, 1);
        assert_eq!(contact.messages, vec!["You: hi"]);

        // Bob's UI learned about the new contact.
        assert!(!bob.output.contact_updates().is_empty());
    }

    #[tokio::test]
    async fn cross_cap_round_trip() {
        let network = MemoryBusNetwork::new();
        let url1 = start_cap(&network).await;
        let url2 = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url1);
        let bob = build_client(b_dir.path(), "Bob", "", &url2);

        alice.session.clone().connect().await.unwrap();
        bob.session.clone().connect().await.unwrap();

        alice
            .store
            .insert_contact(bob.keypair.address(), "Bob")
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "hello")
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(
            wait_until(move || bob_output.contains(&alice_id, "Alice: hello")).await,
            "bob never saw the cross-cap message"
        );
    }

    #[tokio::test]
    async fn stale_nonce_is_a_possible_replay() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url);
        let bob = build_client(b_dir.path(), "Bob", "", &url);

        alice.session.clone().connect().await.unwrap();
        bob.session.clone().connect().await.unwrap();

        alice
            .store
            .insert_contact(bob.keypair.address(), "Bob")
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "one")
            .await
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "two")
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(wait_until(move || bob_output.contains(&alice_id, "Alice: two")).await);

        // An adversary replays the first message through the mesh.
        network
            .endpoint()
            .publish(bus_envelope(
                &alice.keypair,
                "Alice",
                bob.keypair.address(),
                "one",
                1,
            ))
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        assert!(
            wait_until(move || bob_output.contains("system", "possible replay")).await,
            "replay was not flagged"
        );

        let bob_session = bob.session.clone();
        assert!(
            wait_until(move || bob_session.state() == SessionState::Closed).await,
            "receive pump kept running after a replay"
        );
    }

    #[tokio::test]
    async fn nonce_gap_is_a_possible_replay() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let b_dir = tempfile::tempdir().unwrap();
        let bob = build_client(b_dir.path(), "Bob", "", &url);
        bob.session.clone().connect().await.unwrap();

        let alice = Keypair::generate();

        // First contact arrives with a nonce gap: expected 1, got 3.
        network
            .endpoint()
            .publish(bus_envelope(&alice, "Alice", bob.keypair.address(), "hi", 3))
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        assert!(wait_until(move || bob_output.contains("system", "possible replay")).await);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_dropped_silently() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url);
        let bob = build_client(b_dir.path(), "Bob", "", &url);

        alice.session.clone().connect().await.unwrap();
        bob.session.clone().connect().await.unwrap();

        alice
            .store
            .insert_contact(bob.keypair.address(), "Bob")
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "one")
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(wait_until(move || bob_output.contains(&alice_id, "Alice: one")).await);

        // The bus redelivers the already-accepted message.
        network
            .endpoint()
            .publish(bus_envelope(
                &alice.keypair,
                "Alice",
                bob.keypair.address(),
                "one",
                1,
            ))
            .await
            .unwrap();

        // The session survives and the next message flows normally.
        alice
            .session
            .send_message(bob.keypair.address(), "two")
            .await
            .unwrap();

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(wait_until(move || bob_output.contains(&alice_id, "Alice: two")).await);

        assert!(!bob.output.contains("system", "possible replay"));
        let texts = bob.output.texts();
        let ones = texts
            .iter()
            .filter(|(_, msg)| msg == "Alice: one")
            .count();
        assert_eq!(ones, 1, "duplicate was delivered to the user");
    }

    #[tokio::test]
    async fn share_key_reaches_the_contact_store() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", FAKE_PEM, &url);
        let bob = build_client(b_dir.path(), "Bob", "", &url);

        alice.session.clone().connect().await.unwrap();
        bob.session.clone().connect().await.unwrap();

        alice
            .store
            .insert_contact(bob.keypair.address(), "Bob")
            .unwrap();
        alice
            .session
            .send_message(bob.keypair.address(), "/share key")
            .await
            .unwrap();

        let bob_store = bob.store.clone();
        let alice_addr = alice.keypair.address();
        assert!(
            wait_until(move || {
                bob_store
                    .query_contact_by_id(alice_addr)
                    .map(|contact| contact.key == FAKE_PEM)
                    .unwrap_or(false)
            })
            .await,
            "key never landed in bob's store"
        );

        let bob_output = bob.output.clone();
        let alice_id = alice.keypair.address().to_hex();
        assert!(
            wait_until(move || bob_output.contains(&alice_id, "** updated contact's key **"))
                .await
        );
    }

    #[tokio::test]
    async fn share_key_without_key_material_fails() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url);
        alice.session.clone().connect().await.unwrap();

        let to = Address::new([0x02; 20]);
        alice.store.insert_contact(to, "Bob").unwrap();

        match alice.session.send_message(to, "/share key").await {
            Err(Error::NoKey) => {}
            other => panic!("expected NoKey, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_rejects_misuse() {
        let network = MemoryBusNetwork::new();
        let url = start_cap(&network).await;

        let a_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &url);

        // Not connected yet.
        assert!(matches!(
            alice
                .session
                .send_message(Address::new([0x02; 20]), "hi")
                .await,
            Err(Error::ConnectionClosed)
        ));

        alice.session.clone().connect().await.unwrap();

        assert!(matches!(
            alice
                .session
                .send_message(Address::new([0x02; 20]), "")
                .await,
            Err(Error::InvalidArgument(_))
        ));

        assert!(matches!(
            alice
                .session
                .send_message(Address::new([0x02; 20]), "hi")
                .await,
            Err(Error::UnknownContact(_))
        ));

        let to = Address::new([0x02; 20]);
        alice.store.insert_contact(to, "Bob").unwrap();
        assert!(matches!(
            alice.session.send_message(to, "/frobnicate now").await,
            Err(Error::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_a_nonconforming_server() {
        use warp::Filter;

        // A server that greets with the wrong banner.
        let route = warp::path("connect").and(warp::ws()).map(|ws: warp::ws::Ws| {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.send(warp::ws::Message::text("HOWDY")).await;
                let _ = socket.next().await;
            })
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let a_dir = tempfile::tempdir().unwrap();
        let alice = build_client(a_dir.path(), "Alice", "", &format!("ws://{addr}/connect"));

        match alice.session.clone().connect().await {
            Err(Error::HandshakeFailed(reason)) => assert!(reason.contains("HOWDY")),
            other => panic!("expected HandshakeFailed, got {other:?}"),
        }
        assert_eq!(alice.session.state(), SessionState::Disconnected);
    }
}
