use crate::address::Address;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

const DB_DIR_NAME: &str = "db";
const MSGS_DIR_NAME: &str = "msgs";
const DATA_FILE_NAME: &str = "data.json";

/// The account that owns this store. Exactly one per store.
#[derive(Debug, Clone)]
pub struct MyAccount {
    pub id: Address,
    pub name: String,
}

/// One contact: the nonce bookkeeping for both directions, an optional
/// shared public key, and the append-only message log.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: Address,
    pub name: String,
    pub app_last_nonce: u64,
    pub last_nonce: u64,
    pub key: String,
    pub messages: Vec<String>,
}

/// The durable per-contact record behind the client session.
///
/// The store is the authoritative nonce and history record: a nonce update
/// is on disk before the call returns, otherwise a crash would allow replay.
pub trait ContactStore: Send + Sync {
    fn my_account(&self) -> MyAccount;
    fn contacts(&self) -> Vec<Contact>;
    fn query_contact_by_id(&self, id: Address) -> Result<Contact>;
    /// Inserts a contact; if the id is already present the existing record
    /// is returned unchanged.
    fn insert_contact(&self, id: Address, name: &str) -> Result<Contact>;
    fn insert_message(&self, id: Address, msg: &str) -> Result<()>;
    /// Requires `nonce == app_last_nonce + 1`.
    fn update_app_nonce(&self, id: Address, nonce: u64) -> Result<()>;
    /// Requires `nonce == last_nonce + 1`.
    fn update_contact_nonce(&self, id: Address, nonce: u64) -> Result<()>;
    /// Overwrites unconditionally.
    fn update_contact_key(&self, id: Address, pem: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// File-backed implementation: db/data.json for the account, contacts, nonces
// and keys; db/msgs/<address>.msg as one-line-per-message append-only logs.

#[derive(Debug, Serialize, Deserialize)]
struct DataFileAccount {
    id: Address,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataFileContact {
    id: Address,
    name: String,
    #[serde(default)]
    app_last_nonce: u64,
    #[serde(default)]
    last_nonce: u64,
    #[serde(default)]
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataFile {
    my_account: DataFileAccount,
    contacts: Vec<DataFileContact>,
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    my_account: MyAccount,
    cache: RwLock<HashMap<Address, Contact>>,
}

impl FileStore {
    /// Opens the store rooted at `dir`, creating it on first boot. Boot
    /// fails if an existing store belongs to a different account.
    pub fn new(dir: &Path, account_id: Address, account_name: &str) -> Result<FileStore> {
        let db_dir = dir.join(DB_DIR_NAME);
        std::fs::create_dir_all(db_dir.join(MSGS_DIR_NAME))?;

        let data_file_name = db_dir.join(DATA_FILE_NAME);

        let data_file = if data_file_name.exists() {
            let contents = std::fs::read_to_string(&data_file_name)?;
            let data_file: DataFile = serde_json::from_str(&contents)
                .map_err(|err| Error::Malformed(format!("data file: {err}")))?;

            if data_file.my_account.id != account_id {
                return Err(Error::InvalidArgument(format!(
                    "account id mismatch: got {}, expected {}",
                    data_file.my_account.id, account_id
                )));
            }

            data_file
        } else {
            let data_file = DataFile {
                my_account: DataFileAccount {
                    id: account_id,
                    name: account_name.to_string(),
                },
                contacts: Vec::new(),
            };
            write_data_file(&data_file_name, &data_file)?;
            data_file
        };

        let cache = data_file
            .contacts
            .into_iter()
            .map(|contact| {
                (
                    contact.id,
                    Contact {
                        id: contact.id,
                        name: contact.name,
                        app_last_nonce: contact.app_last_nonce,
                        last_nonce: contact.last_nonce,
                        key: contact.key,
                        messages: Vec::new(),
                    },
                )
            })
            .collect();

        Ok(FileStore {
            dir: dir.to_path_buf(),
            my_account: MyAccount {
                id: data_file.my_account.id,
                name: data_file.my_account.name,
            },
            cache: RwLock::new(cache),
        })
    }

    // A poisoned lock only means a writer panicked mid-update; the data
    // itself is still the last consistent flush.
    fn lock_cache(&self) -> RwLockWriteGuard<'_, HashMap<Address, Contact>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_file_name(&self) -> PathBuf {
        self.dir.join(DB_DIR_NAME).join(DATA_FILE_NAME)
    }

    fn msgs_file_name(&self, id: Address) -> PathBuf {
        self.dir
            .join(DB_DIR_NAME)
            .join(MSGS_DIR_NAME)
            .join(format!("{}.msg", id.to_hex()))
    }

    fn flush_locked(&self, cache: &HashMap<Address, Contact>) -> Result<()> {
        let data_file = DataFile {
            my_account: DataFileAccount {
                id: self.my_account.id,
                name: self.my_account.name.clone(),
            },
            contacts: cache
                .values()
                .map(|contact| DataFileContact {
                    id: contact.id,
                    name: contact.name.clone(),
                    app_last_nonce: contact.app_last_nonce,
                    last_nonce: contact.last_nonce,
                    key: contact.key.clone(),
                })
                .collect(),
        };

        write_data_file(&self.data_file_name(), &data_file)
    }

    fn load_messages(&self, id: Address) -> Result<Vec<String>> {
        let file_name = self.msgs_file_name(id);
        if !file_name.exists() {
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(file_name)?;
        Ok(contents.lines().map(str::to_string).collect())
    }
}

fn write_data_file(file_name: &Path, data_file: &DataFile) -> Result<()> {
    let json = serde_json::to_string_pretty(data_file)
        .map_err(|err| Error::Malformed(format!("data file marshal: {err}")))?;
    std::fs::write(file_name, json)?;
    Ok(())
}

impl ContactStore for FileStore {
    fn my_account(&self) -> MyAccount {
        self.my_account.clone()
    }

    fn contacts(&self) -> Vec<Contact> {
        self.lock_cache().values().cloned().collect()
    }

    fn query_contact_by_id(&self, id: Address) -> Result<Contact> {
        let mut cache = self.lock_cache();

        let needs_messages = match cache.get(&id) {
            None => return Err(Error::UnknownContact(id)),
            Some(contact) => contact.messages.is_empty(),
        };

        if needs_messages {
            let messages = self.load_messages(id)?;
            if let Some(contact) = cache.get_mut(&id) {
                contact.messages = messages;
            }
        }

        cache
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownContact(id))
    }

    fn insert_contact(&self, id: Address, name: &str) -> Result<Contact> {
        let mut cache = self.lock_cache();

        if let Some(existing) = cache.get(&id) {
            return Ok(existing.clone());
        }

        let contact = Contact {
            id,
            name: name.to_string(),
            app_last_nonce: 0,
            last_nonce: 0,
            key: String::new(),
            messages: Vec::new(),
        };
        cache.insert(id, contact.clone());
        self.flush_locked(&cache)?;

        Ok(contact)
    }

    fn insert_message(&self, id: Address, msg: &str) -> Result<()> {
        let mut cache = self.lock_cache();

        let contact = cache.get_mut(&id).ok_or(Error::UnknownContact(id))?;
        contact.messages.push(msg.to_string());

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.msgs_file_name(id))?;
        writeln!(file, "{msg}")?;

        Ok(())
    }

    fn update_app_nonce(&self, id: Address, nonce: u64) -> Result<()> {
        let mut cache = self.lock_cache();

        let contact = cache.get_mut(&id).ok_or(Error::UnknownContact(id))?;
        let expected = contact.app_last_nonce + 1;
        if nonce != expected {
            return Err(Error::NonceOutOfOrder {
                got: nonce,
                expected,
            });
        }

        contact.app_last_nonce = nonce;
        self.flush_locked(&cache)
    }

    fn update_contact_nonce(&self, id: Address, nonce: u64) -> Result<()> {
        let mut cache = self.lock_cache();

        let contact = cache.get_mut(&id).ok_or(Error::UnknownContact(id))?;
        let expected = contact.last_nonce + 1;
        if nonce != expected {
            return Err(Error::NonceOutOfOrder {
                got: nonce,
                expected,
            });
        }

        contact.last_nonce = nonce;
        self.flush_locked(&cache)
    }

    fn update_contact_key(&self, id: Address, pem: &str) -> Result<()> {
        let mut cache = self.lock_cache();

        let contact = cache.get_mut(&id).ok_or(Error::UnknownContact(id))?;
        contact.key = pem.to_string();
        self.flush_locked(&cache)
    }
}
