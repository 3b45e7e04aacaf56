//! Encrypted secret store session and per-device credential resolution.
//! The envelope key and the decrypted credential map live only between
//! `unlock` and `lock` and are never written anywhere.

pub mod crypto;

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;

use crate::db::entities::credential::{CredentialInfo, CredentialRow};
use crate::db::entities::device::DeviceDetail;
use crate::db::enums::CredentialTestResult;
use crate::db::{SqlitePool, StoreError};
use crate::ssh::SshCredentials;
use crypto::CryptoError;

const META_SALT: &str = "salt";
const META_VERIFIER: &str = "verifier";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secret store is locked")]
    Locked,
    #[error("secret store has not been initialized")]
    NotInitialized,
    #[error("secret store password is incorrect")]
    BadPassword,
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

struct Session {
    credentials: HashMap<i64, SshCredentials>,
    by_name: HashMap<String, i64>,
    default_id: Option<i64>,
}

/// Handle to the secret store. Cheap to share behind an `Arc`; the unlock
/// state is interior.
pub struct Vault {
    pool: SqlitePool,
    session: RwLock<Option<Session>>,
}

impl Vault {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            session: RwLock::new(None),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.read().expect("vault lock poisoned").is_some()
    }

    /// Verifies the password, derives the envelope key and decrypts every
    /// credential into memory.
    pub async fn unlock(&self, password: &str) -> Result<(), VaultError> {
        let pool = self.pool.clone();
        let password = password.to_string();

        let session = tokio::task::spawn_blocking(move || -> Result<Session, VaultError> {
            let conn = pool.get().map_err(StoreError::from)?;

            let salt_hex = meta_value(&conn, META_SALT)?.ok_or(VaultError::NotInitialized)?;
            let verifier_hex =
                meta_value(&conn, META_VERIFIER)?.ok_or(VaultError::NotInitialized)?;
            let salt = hex::decode(&salt_hex).map_err(CryptoError::from)?;
            let verifier = hex::decode(&verifier_hex).map_err(CryptoError::from)?;

            if crypto::derive_verifier(&password, &salt).as_slice() != verifier.as_slice() {
                return Err(VaultError::BadPassword);
            }
            let key = crypto::derive_key(&password, &salt);

            let rows = credential_rows(&conn)?;
            let mut credentials = HashMap::with_capacity(rows.len());
            let mut by_name = HashMap::with_capacity(rows.len());
            let mut default_id = None;
            for row in rows {
                let decrypted = SshCredentials {
                    credential_id: Some(row.id),
                    credential_name: Some(row.name.clone()),
                    username: row.username.clone(),
                    password: row
                        .password_encrypted
                        .as_deref()
                        .map(|c| crypto::decrypt(c, &key))
                        .transpose()?,
                    private_key: row
                        .private_key_encrypted
                        .as_deref()
                        .map(|c| crypto::decrypt(c, &key))
                        .transpose()?,
                    key_passphrase: row
                        .key_passphrase_encrypted
                        .as_deref()
                        .map(|c| crypto::decrypt(c, &key))
                        .transpose()?,
                };
                if row.is_default {
                    default_id = Some(row.id);
                }
                by_name.insert(row.name, row.id);
                credentials.insert(row.id, decrypted);
            }

            Ok(Session {
                credentials,
                by_name,
                default_id,
            })
        })
        .await
        .map_err(StoreError::from)??;

        let count = session.credentials.len();
        *self.session.write().expect("vault lock poisoned") = Some(session);
        info!(credentials = count, "secret store unlocked");
        Ok(())
    }

    /// Configured fallback: take the password from an environment variable.
    pub async fn unlock_from_env(&self, var: &str) -> Result<(), VaultError> {
        let password =
            std::env::var(var).map_err(|_| VaultError::MissingEnv(var.to_string()))?;
        self.unlock(&password).await
    }

    /// Drops the envelope key and every decrypted credential.
    pub fn lock(&self) {
        *self.session.write().expect("vault lock poisoned") = None;
        info!("secret store locked");
    }

    pub fn credential_by_id(&self, id: i64) -> Result<Option<SshCredentials>, VaultError> {
        let guard = self.session.read().expect("vault lock poisoned");
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(session.credentials.get(&id).cloned())
    }

    pub fn credential_by_name(&self, name: &str) -> Result<Option<SshCredentials>, VaultError> {
        let guard = self.session.read().expect("vault lock poisoned");
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(session
            .by_name
            .get(name)
            .and_then(|id| session.credentials.get(id))
            .cloned())
    }

    pub fn default_credential(&self) -> Result<Option<SshCredentials>, VaultError> {
        let guard = self.session.read().expect("vault lock poisoned");
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(session
            .default_id
            .and_then(|id| session.credentials.get(&id))
            .cloned())
    }

    /// Every decrypted credential, ordered by name. Discovery's candidate set.
    pub fn unlocked_credentials(&self) -> Result<Vec<SshCredentials>, VaultError> {
        let guard = self.session.read().expect("vault lock poisoned");
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        let mut all: Vec<_> = session.credentials.values().cloned().collect();
        all.sort_by(|a, b| a.credential_name.cmp(&b.credential_name));
        Ok(all)
    }

    /// Resolution chain for a normal run: the device's pinned credential
    /// (only when its last test succeeded), then the run-wide override,
    /// then the store default.
    pub fn resolve_for_device(
        &self,
        device: &DeviceDetail,
        override_name: Option<&str>,
    ) -> Result<Option<SshCredentials>, VaultError> {
        let guard = self.session.read().expect("vault lock poisoned");
        let session = guard.as_ref().ok_or(VaultError::Locked)?;

        if device.credential_test_result == CredentialTestResult::Success {
            if let Some(pinned) = device
                .credential_id
                .and_then(|id| session.credentials.get(&id))
            {
                return Ok(Some(pinned.clone()));
            }
        }
        if let Some(name) = override_name {
            return Ok(session
                .by_name
                .get(name)
                .and_then(|id| session.credentials.get(id))
                .cloned());
        }
        Ok(session
            .default_id
            .and_then(|id| session.credentials.get(&id))
            .cloned())
    }

    /// Credential metadata without secrets. Works while locked.
    pub async fn list_credentials(&self) -> Result<Vec<CredentialInfo>, VaultError> {
        let pool = self.pool.clone();
        let infos = tokio::task::spawn_blocking(move || -> Result<Vec<CredentialInfo>, StoreError> {
            let conn = pool.get()?;
            let rows = credential_rows(&conn)?;
            Ok(rows
                .into_iter()
                .map(|row| CredentialInfo {
                    id: row.id,
                    name: row.name,
                    username: row.username,
                    is_default: row.is_default,
                    has_password: row.password_encrypted.is_some(),
                    has_private_key: row.private_key_encrypted.is_some(),
                })
                .collect())
        })
        .await
        .map_err(StoreError::from)?;
        Ok(infos?)
    }
}

fn meta_value(conn: &rusqlite::Connection, key: &str) -> Result<Option<String>, StoreError> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT value FROM vault_meta WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn credential_rows(conn: &rusqlite::Connection) -> Result<Vec<CredentialRow>, StoreError> {
    let mut stmt = conn.prepare("SELECT * FROM credentials ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(CredentialRow {
            id: row.get("id")?,
            name: row.get("name")?,
            username: row.get("username")?,
            password_encrypted: row.get("password_encrypted")?,
            private_key_encrypted: row.get("private_key_encrypted")?,
            key_passphrase_encrypted: row.get("key_passphrase_encrypted")?,
            is_default: row.get::<_, i64>("is_default")? != 0,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}
