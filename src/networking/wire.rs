use crate::address::Address;
use crate::crypto::{Signature, SignedPayload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identity frame a client sends right after `HELLO`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeIdentity {
    #[serde(rename = "ID")]
    pub id: Address,
    #[serde(rename = "Name")]
    pub name: String,
}

/// A signed text message as sent client → CAP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    #[serde(rename = "toID")]
    pub to_id: Address,
    pub msg: String,
    #[serde(rename = "fromNonce")]
    pub from_nonce: u64,
    #[serde(flatten)]
    pub sig: Signature,
}

impl SignedMessage {
    /// The payload the attached signature attests to.
    pub fn signed_payload(&self) -> SignedPayload {
        SignedPayload {
            to_id: self.to_id,
            msg: self.msg.clone(),
            from_nonce: self.from_nonce,
        }
    }
}

/// The sender block of a delivered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutUser {
    pub id: Address,
    pub name: String,
    pub nonce: u64,
}

/// A message as delivered CAP → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutMessage {
    pub from: OutUser,
    pub msg: String,
}

/// The envelope carrying a signed message across CAPs. The original payload
/// and signature are preserved verbatim so any CAP can re-verify, and
/// `cap_id` lets the originating CAP drop its own publications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "capID")]
    pub cap_id: Uuid,
    #[serde(rename = "fromID")]
    pub from_id: Address,
    #[serde(rename = "fromName")]
    pub from_name: String,
    #[serde(rename = "toID")]
    pub to_id: Address,
    pub msg: String,
    #[serde(rename = "fromNonce")]
    pub from_nonce: u64,
    #[serde(flatten)]
    pub sig: Signature,
}

impl BusMessage {
    pub fn signed_payload(&self) -> SignedPayload {
        SignedPayload {
            to_id: self.to_id,
            msg: self.msg.clone(),
            from_nonce: self.from_nonce,
        }
    }
}
