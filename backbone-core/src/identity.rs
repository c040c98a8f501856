//! Directory-backed identity store: one PEM file per client, plus the
//! server's own persistent private key.
//!
//! ```text
//! <state_dir>/server/key.pem          PEM-PKCS#1 private key (server)
//! <state_dir>/clients/<hex_id>        PEM-PKCS#1 public key  (per client)
//! ```
//!
//! Reads are lock-free (filesystem reads are naturally concurrent-safe);
//! writes are serialized by a single mutex since they are rare and
//! administrative, per spec.

use crate::crypto::{self, CryptoError};
use crate::id::ClientId;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

pub struct IdentityStore {
    clients_dir: PathBuf,
    server_dir: PathBuf,
    server_key_path: PathBuf,
    server_private_key: RsaPrivateKey,
    server_public_key: RsaPublicKey,
    server_public_key_pem: Vec<u8>,
    write_lock: Mutex<()>,
}

impl IdentityStore {
    /// Creates `clients/` and `server/` under `dir` if missing, and
    /// generates-or-loads the server's private key.
    pub async fn init(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let clients_dir = dir.join("clients");
        let server_dir = dir.join("server");
        fs::create_dir_all(&clients_dir).await?;
        fs::create_dir_all(&server_dir).await?;

        let server_key_path = server_dir.join("key.pem");
        let server_private_key = if fs::metadata(&server_key_path).await.is_ok() {
            let pem = fs::read(&server_key_path).await?;
            crypto::deserialize_private(&pem)?
        } else {
            let key = crypto::generate()?;
            let pem = crypto::serialize_private(&key)?;
            fs::write(&server_key_path, &pem).await?;
            key
        };

        let server_public_key = RsaPublicKey::from(&server_private_key);
        let server_public_key_pem = crypto::serialize_public(&server_public_key)?;

        Ok(Self {
            clients_dir,
            server_dir,
            server_key_path,
            server_private_key,
            server_public_key,
            server_public_key_pem,
            write_lock: Mutex::new(()),
        })
    }

    pub fn server_private_key(&self) -> &RsaPrivateKey {
        &self.server_private_key
    }

    pub fn server_public_key(&self) -> &RsaPublicKey {
        &self.server_public_key
    }

    pub fn server_public_key_pem(&self) -> &[u8] {
        &self.server_public_key_pem
    }

    fn client_path(&self, id: ClientId) -> PathBuf {
        self.clients_dir.join(id.hex())
    }

    pub async fn get(&self, id: ClientId) -> Result<Option<RsaPublicKey>> {
        let path = self.client_path(id);
        match fs::read(&path).await {
            Ok(pem) => Ok(Some(crypto::deserialize_public(&pem)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes only if absent. Returns `true` on create, `false` if a file
    /// already existed.
    pub async fn add(&self, id: ClientId, key: &RsaPublicKey) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.client_path(id);
        if fs::metadata(&path).await.is_ok() {
            return Ok(false);
        }
        let pem = crypto::serialize_public(key)?;
        fs::write(&path, &pem).await?;
        Ok(true)
    }

    /// Overwrites an existing entry. Returns `true` only if the file
    /// already existed.
    pub async fn set(&self, id: ClientId, key: &RsaPublicKey) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.client_path(id);
        let existed = fs::metadata(&path).await.is_ok();
        let pem = crypto::serialize_public(key)?;
        fs::write(&path, &pem).await?;
        Ok(existed)
    }

    pub async fn remove(&self, id: ClientId) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.client_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate;

    async fn temp_store() -> (IdentityStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::init(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn init_creates_and_persists_server_key() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fs::metadata(dir.path().join("server/key.pem")).await.is_err());
        let store = IdentityStore::init(dir.path()).await.unwrap();
        assert!(fs::metadata(&store.server_key_path).await.is_ok());

        // Re-init loads the same key rather than regenerating.
        let store2 = IdentityStore::init(dir.path()).await.unwrap();
        assert_eq!(
            crypto::serialize_private(store.server_private_key()).unwrap(),
            crypto::serialize_private(store2.server_private_key()).unwrap(),
        );
    }

    #[tokio::test]
    async fn add_get_remove_cycle() {
        let (store, _dir) = temp_store().await;
        let id = ClientId::new();
        let key = RsaPublicKey::from(&generate().unwrap());

        assert_eq!(store.get(id).await.unwrap(), None);
        assert!(store.add(id, &key).await.unwrap());
        assert!(!store.add(id, &key).await.unwrap());
        assert_eq!(store.get(id).await.unwrap(), Some(key.clone()));
        assert!(store.remove(id).await.unwrap());
        assert_eq!(store.get(id).await.unwrap(), None);
        assert!(!store.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn set_overwrites_only_if_present() {
        let (store, _dir) = temp_store().await;
        let id = ClientId::new();
        let key_a = RsaPublicKey::from(&generate().unwrap());
        let key_b = RsaPublicKey::from(&generate().unwrap());

        assert!(!store.set(id, &key_a).await.unwrap());
        assert_eq!(store.get(id).await.unwrap(), Some(key_a));
        assert!(store.set(id, &key_b).await.unwrap());
        assert_eq!(store.get(id).await.unwrap(), Some(key_b));
    }
}
