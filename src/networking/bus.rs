use crate::error::{Error, Result};
use async_nats::jetstream::{self, consumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// How long the stream retains cross-CAP messages.
const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A durable pub/sub bus carrying cross-CAP messages on a single subject.
///
/// `publish` returns only after the bus acknowledges persistence. `next`
/// blocks for the next delivery and acks it immediately on receipt, so
/// delivery is at-least-once and callers must tolerate duplicates.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;
    async fn next(&self) -> Result<Vec<u8>>;
}

/// The JetStream-backed bus. The stream is named after the subject, and each
/// CAP attaches a durable pull consumer named by its own UUID so in-flight
/// messages survive a restart.
pub struct JetStreamBus {
    js: jetstream::Context,
    subject: String,
    messages: Mutex<consumer::pull::Stream>,
}

impl JetStreamBus {
    pub async fn connect(host: &str, subject: &str, cap_id: Uuid) -> Result<JetStreamBus> {
        let client = async_nats::connect(host)
            .await
            .map_err(|err| Error::BusUnavailable(format!("connect: {err}")))?;

        let js = jetstream::new(client);

        let stream = js
            .get_or_create_stream(jetstream::stream::Config {
                name: subject.to_string(),
                subjects: vec![subject.to_string()],
                max_age: RETENTION,
                ..Default::default()
            })
            .await
            .map_err(|err| Error::BusUnavailable(format!("create stream: {err}")))?;

        let durable = cap_id.to_string();
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    deliver_policy: consumer::DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| Error::BusUnavailable(format!("create consumer: {err}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|err| Error::BusUnavailable(format!("consume: {err}")))?;

        info!(subject, consumer = %durable, "bus attached");

        Ok(JetStreamBus {
            js,
            subject: subject.to_string(),
            messages: Mutex::new(messages),
        })
    }
}

#[async_trait]
impl MessageBus for JetStreamBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let ack = self
            .js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|err| Error::BusUnavailable(format!("publish: {err}")))?;

        ack.await
            .map_err(|err| Error::BusUnavailable(format!("publish ack: {err}")))?;

        Ok(())
    }

    async fn next(&self) -> Result<Vec<u8>> {
        let mut messages = self.messages.lock().await;

        let message = match messages.next().await {
            None => return Err(Error::ConnectionClosed),
            Some(Err(err)) => match err.kind() {
                consumer::pull::MessagesErrorKind::ConsumerDeleted => {
                    return Err(Error::ConsumerDeleted)
                }
                _ => return Err(Error::BusUnavailable(format!("pull: {err}"))),
            },
            Some(Ok(message)) => message,
        };

        message
            .ack()
            .await
            .map_err(|err| Error::BusUnavailable(format!("ack: {err}")))?;

        Ok(message.payload.to_vec())
    }
}

/// Loads the CAP's durable consumer identity from `<dir>/cap.id`, creating
/// and persisting a fresh UUID on first boot. Losing this file forfeits
/// in-flight bus messages addressed through this CAP's consumer name.
pub fn load_or_create_cap_id(dir: &Path) -> Result<Uuid> {
    let file_name = dir.join("cap.id");

    if !file_name.exists() {
        std::fs::create_dir_all(dir)?;
        std::fs::write(&file_name, Uuid::new_v4().to_string())?;
    }

    let contents = std::fs::read_to_string(&file_name)?;
    let cap_id = Uuid::parse_str(contents.trim())
        .map_err(|err| Error::Malformed(format!("cap id file: {err}")))?;

    Ok(cap_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_id_survives_reboot() {
        let dir = tempfile::tempdir().unwrap();

        let first = load_or_create_cap_id(dir.path()).unwrap();
        let second = load_or_create_cap_id(dir.path()).unwrap();
        assert_eq!(first, second);

        let on_disk = std::fs::read_to_string(dir.path().join("cap.id")).unwrap();
        assert_eq!(on_disk.trim(), first.to_string());
    }

    #[test]
    fn corrupt_cap_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cap.id"), "not-a-uuid").unwrap();

        match load_or_create_cap_id(dir.path()) {
            Err(Error::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
