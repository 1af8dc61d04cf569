use crate::address::Address;
use crate::error::{Error, Result};
use crate::keypair::Keypair;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use tracing::info;

const ID_FILE_NAME: &str = "key.ecdsa";
const ENC_FILE_NAME: &str = "key.rsa";
const SHARE_KEY_BITS: usize = 2048;

/// The client's long-lived key material: the signing identity plus an RSA
/// share key whose public half can be handed to contacts with `/share key`.
pub struct Identity {
    keypair: Keypair,
    share_key_pem: String,
}

impl Identity {
    /// Loads the identity from `<dir>/id/`, generating and persisting fresh
    /// key material on first boot.
    pub fn load_or_create(dir: &Path) -> Result<Identity> {
        let id_dir = dir.join("id");
        std::fs::create_dir_all(&id_dir)?;

        let key_file = id_dir.join(ID_FILE_NAME);
        let keypair = if key_file.exists() {
            Keypair::from_hex(&std::fs::read_to_string(&key_file)?)?
        } else {
            let keypair = Keypair::generate();
            std::fs::write(&key_file, keypair.to_hex())?;
            info!(address = %keypair.address(), "created signing key");
            keypair
        };

        let enc_file = id_dir.join(ENC_FILE_NAME);
        let share_key = if enc_file.exists() {
            RsaPrivateKey::from_pkcs8_pem(&std::fs::read_to_string(&enc_file)?)
                .map_err(|err| Error::Identity(format!("share key read: {err}")))?
        } else {
            let share_key = RsaPrivateKey::new(&mut OsRng, SHARE_KEY_BITS)
                .map_err(|err| Error::Identity(format!("share key generate: {err}")))?;
            let pem = share_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| Error::Identity(format!("share key encode: {err}")))?;
            std::fs::write(&enc_file, pem.as_bytes())?;
            share_key
        };

        let share_key_pem = RsaPublicKey::from(&share_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| Error::Identity(format!("share pubkey encode: {err}")))?;

        Ok(Identity {
            keypair,
            share_key_pem,
        })
    }

    /// Builds an identity from existing key material. An empty
    /// `share_key_pem` means there is no key to share.
    pub fn from_parts(keypair: Keypair, share_key_pem: String) -> Identity {
        Identity {
            keypair,
            share_key_pem,
        }
    }

    /// The account address derived from the signing key.
    pub fn account_id(&self) -> Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The PEM-encoded public half of the share key, empty if none exists.
    pub fn share_key_pem(&self) -> &str {
        &self.share_key_pem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();

        let first = Identity::load_or_create(dir.path()).unwrap();
        let second = Identity::load_or_create(dir.path()).unwrap();

        assert_eq!(first.account_id(), second.account_id());
        assert_eq!(first.share_key_pem(), second.share_key_pem());
        assert!(first.share_key_pem().contains("BEGIN PUBLIC KEY"));

        assert!(dir.path().join("id").join(ID_FILE_NAME).exists());
        assert!(dir.path().join("id").join(ENC_FILE_NAME).exists());
    }

    #[test]
    fn corrupt_signing_key_fails_boot() {
        let dir = tempfile::tempdir().unwrap();
        let id_dir = dir.path().join("id");
        std::fs::create_dir_all(&id_dir).unwrap();
        std::fs::write(id_dir.join(ID_FILE_NAME), "garbage").unwrap();

        assert!(Identity::load_or_create(dir.path()).is_err());
    }
}
