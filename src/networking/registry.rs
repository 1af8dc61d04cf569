use crate::address::Address;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::debug;
use warp::ws::Message;

/// Frames queued for a connection's write-forward task. Mirrors the frame
/// stream's own item type so the queue can be forwarded into the sink as-is.
pub type FrameSender = mpsc::UnboundedSender<std::result::Result<Message, warp::Error>>;

/// One attached user. The registry exclusively owns the connection; no other
/// component may close it directly.
pub struct User {
    pub id: Address,
    pub name: String,
    pub conn: FrameSender,
    cancel: Arc<Notify>,
    last_ping: Instant,
    last_pong: Instant,
}

impl User {
    pub fn new(id: Address, name: String, conn: FrameSender, cancel: Arc<Notify>) -> User {
        let now = Instant::now();
        User {
            id,
            name,
            conn,
            cancel,
            last_ping: now,
            last_pong: now,
        }
    }
}

/// A lock-free snapshot entry from [`UserRegistry::connections`].
pub struct Connection {
    pub conn: FrameSender,
    pub last_ping: Instant,
    pub last_pong: Instant,
}

/// A retrieval result carrying what the router needs to deliver a frame.
#[derive(Clone, Debug)]
pub struct Recipient {
    pub id: Address,
    pub name: String,
    pub conn: FrameSender,
}

/// In-memory address → user table behind a reader/writer lock, enforcing
/// at-most-one session per identity on this CAP.
pub struct UserRegistry {
    users: RwLock<HashMap<Address, User>>,
}

impl UserRegistry {
    pub fn new() -> UserRegistry {
        UserRegistry {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a user, failing with `AlreadyExists` on a duplicate identity.
    pub async fn add(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;

        if users.contains_key(&user.id) {
            return Err(Error::AlreadyExists);
        }

        debug!(id = %user.id, name = %user.name, "user added");
        users.insert(user.id, user);

        Ok(())
    }

    /// Removes a user and cancels its read pump, which closes the socket.
    pub async fn remove(&self, id: Address) {
        let mut users = self.users.write().await;

        match users.remove(&id) {
            Some(user) => {
                user.cancel.notify_one();
                debug!(id = %id, name = %user.name, "user removed");
            }
            None => debug!(id = %id, "remove: user does not exist"),
        }
    }

    /// Retrieves the delivery handle for a user, failing with `NotExists`.
    pub async fn retrieve(&self, id: Address) -> Result<Recipient> {
        let users = self.users.read().await;

        let user = users.get(&id).ok_or(Error::NotExists)?;
        Ok(Recipient {
            id: user.id,
            name: user.name.clone(),
            conn: user.conn.clone(),
        })
    }

    pub async fn update_last_ping(&self, id: Address) -> Result<()> {
        let mut users = self.users.write().await;

        let user = users.get_mut(&id).ok_or(Error::NotExists)?;
        user.last_ping = Instant::now();
        Ok(())
    }

    pub async fn update_last_pong(&self, id: Address) -> Result<()> {
        let mut users = self.users.write().await;

        let user = users.get_mut(&id).ok_or(Error::NotExists)?;
        user.last_pong = Instant::now();
        Ok(())
    }

    /// Returns a copy of every connection, safe to iterate without the lock.
    pub async fn connections(&self) -> HashMap<Address, Connection> {
        let users = self.users.read().await;

        users
            .iter()
            .map(|(id, user)| {
                (
                    *id,
                    Connection {
                        conn: user.conn.clone(),
                        last_ping: user.last_ping,
                        last_pong: user.last_pong,
                    },
                )
            })
            .collect()
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        UserRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(byte: u8, name: &str) -> (User, Arc<Notify>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(Notify::new());
        (
            User::new(Address::new([byte; 20]), name.into(), tx, cancel.clone()),
            cancel,
        )
    }

    #[tokio::test]
    async fn add_enforces_single_session_per_identity() {
        let registry = UserRegistry::new();

        let (first, _) = test_user(0x01, "Alice");
        registry.add(first).await.unwrap();

        let (duplicate, _) = test_user(0x01, "Mallory");
        match registry.add(duplicate).await {
            Err(Error::AlreadyExists) => {}
            other => panic!("expected AlreadyExists, got {other:?}"),
        }

        // The first session is unaffected.
        let kept = registry.retrieve(Address::new([0x01; 20])).await.unwrap();
        assert_eq!(kept.name, "Alice");
    }

    #[tokio::test]
    async fn retrieve_missing_is_not_exists() {
        let registry = UserRegistry::new();
        match registry.retrieve(Address::new([0x09; 20])).await {
            Err(Error::NotExists) => {}
            other => panic!("expected NotExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remove_cancels_the_read_pump() {
        let registry = UserRegistry::new();
        let (user, cancel) = test_user(0x02, "Bob");
        registry.add(user).await.unwrap();

        registry.remove(Address::new([0x02; 20])).await;

        // notify_one stored a permit, so this resolves immediately.
        tokio::time::timeout(std::time::Duration::from_millis(100), cancel.notified())
            .await
            .expect("cancel signal");

        assert!(matches!(
            registry.retrieve(Address::new([0x02; 20])).await,
            Err(Error::NotExists)
        ));
    }

    #[tokio::test]
    async fn connections_returns_a_snapshot() {
        let registry = UserRegistry::new();
        let (a, _) = test_user(0x01, "Alice");
        let (b, _) = test_user(0x02, "Bob");
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        let snapshot = registry.connections().await;
        assert_eq!(snapshot.len(), 2);

        // Mutating the registry does not touch the snapshot.
        registry.remove(Address::new([0x01; 20])).await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn ping_pong_updates() {
        let registry = UserRegistry::new();
        let (user, _) = test_user(0x03, "Carol");
        let id = Address::new([0x03; 20]);
        registry.add(user).await.unwrap();

        registry.update_last_ping(id).await.unwrap();
        registry.update_last_pong(id).await.unwrap();

        let snapshot = registry.connections().await;
        let conn = snapshot.get(&id).unwrap();
        assert!(conn.last_pong >= conn.last_ping);

        assert!(matches!(
            registry.update_last_ping(Address::new([0x0F; 20])).await,
            Err(Error::NotExists)
        ));
    }
}
