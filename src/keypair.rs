use crate::address::Address;
use crate::crypto::{self, SECP};
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use secp256k1::{PublicKey, SecretKey};
use std::fmt;

/// A secp256k1 keypair identifying one chat user.
#[derive(Clone)]
pub struct Keypair {
    secret_key: SecretKey,
}

impl Keypair {
    /// Creates a keypair with a randomly generated secret key.
    pub fn generate() -> Keypair {
        Keypair {
            secret_key: SecretKey::new(&mut OsRng),
        }
    }

    /// Creates a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Keypair> {
        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|err| Error::Identity(format!("secret key: {err}")))?;
        Ok(Keypair { secret_key })
    }

    /// Creates a keypair from the hex encoding of the secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Keypair> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret_hex.trim(), &mut bytes)
            .map_err(|err| Error::Identity(format!("secret key hex: {err}")))?;
        Keypair::from_secret_bytes(&bytes)
    }

    /// The hex encoding of the secret key, the at-rest form of the identity.
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_secret_key(&SECP, &self.secret_key)
    }

    /// The address derived from the public key.
    pub fn address(&self) -> Address {
        crypto::address_of(&self.public_key())
    }
}

impl fmt::Debug for Keypair {
    // Never print the secret key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.address())
    }
}
