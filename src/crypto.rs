use crate::address::Address;
use crate::error::{Error, Result};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

// A single secp256k1 context shared by every sign/recover call instead of
// creating a new one per operation.
lazy_static::lazy_static! {
    pub(crate) static ref SECP: Secp256k1<All> = Secp256k1::new();
}

/// Domain separation for signed chat payloads. Prepending this string keeps a
/// chat signature from ever being valid as a raw transaction signature.
const SIGN_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// The exact bytes a message signature attests to. Field order is the
/// canonical JSON order on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct SignedPayload {
    #[serde(rename = "ToID")]
    pub to_id: Address,
    #[serde(rename = "Msg")]
    pub msg: String,
    #[serde(rename = "FromNonce")]
    pub from_nonce: u64,
}

/// A recoverable signature triple. `v` carries the recovery parity plus 27.
///
/// On the JSON wire `r` and `s` travel as `0x`-prefixed hex strings since a
/// JSON number cannot hold a 256-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub v: u64,
    #[serde(with = "hex_word")]
    pub r: [u8; 32],
    #[serde(with = "hex_word")]
    pub s: [u8; 32],
}

mod hex_word {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let body = s.strip_prefix("0x").unwrap_or(&s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(body, &mut bytes).map_err(D::Error::custom)?;
        Ok(bytes)
    }
}

/// Hashes the canonical encoding of a payload under the domain prefix.
fn payload_digest(payload: &SignedPayload) -> Result<[u8; 32]> {
    let body = serde_json::to_vec(payload)
        .map_err(|err| Error::Malformed(format!("payload encode: {err}")))?;

    let mut hasher = Keccak256::new();
    hasher.update(SIGN_PREFIX.as_bytes());
    hasher.update(body.len().to_string().as_bytes());
    hasher.update(&body);

    Ok(hasher.finalize().into())
}

/// Signs a payload with the given secret key.
pub fn sign(payload: &SignedPayload, secret_key: &SecretKey) -> Result<Signature> {
    let digest = payload_digest(payload)?;
    let message = Message::from_digest(digest);

    let recoverable = SECP.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = recoverable.serialize_compact();

    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);

    Ok(Signature {
        v: recovery_id.to_i32() as u64 + 27,
        r,
        s,
    })
}

/// Recovers the signing address for a payload, failing with
/// `InvalidSignature` on an unrecognized parity, out-of-range `r`/`s`, or an
/// off-curve point.
pub fn recover_address(payload: &SignedPayload, sig: &Signature) -> Result<Address> {
    if sig.v != 27 && sig.v != 28 {
        return Err(Error::InvalidSignature(format!(
            "unrecognized parity v={}",
            sig.v
        )));
    }

    let recovery_id = RecoveryId::from_i32((sig.v - 27) as i32)
        .map_err(|err| Error::InvalidSignature(format!("recovery id: {err}")))?;

    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&sig.r);
    compact[32..].copy_from_slice(&sig.s);

    let recoverable = RecoverableSignature::from_compact(&compact, recovery_id)
        .map_err(|err| Error::InvalidSignature(format!("signature bytes: {err}")))?;

    let digest = payload_digest(payload)?;
    let message = Message::from_digest(digest);

    let public_key = SECP
        .recover_ecdsa(&message, &recoverable)
        .map_err(|err| Error::InvalidSignature(format!("recover: {err}")))?;

    Ok(address_of(&public_key))
}

/// Derives the address of a public key: Keccak-256 over the 64-byte
/// uncompressed point, low 20 bytes.
pub fn address_of(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let hash: [u8; 32] = Keccak256::digest(&uncompressed[1..]).into();

    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address::new(bytes)
}
