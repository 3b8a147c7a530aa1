//! vCenter credential store
//!
//! Passwords are held AES-256-GCM encrypted in the database and decrypted
//! only at the moment a Node call needs them.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::Rng;
use skybridge_common::Result;
use sqlx::SqlitePool;
use tracing::warn;

/// AES-256-GCM key size in bytes
const KEY_SIZE: usize = 32;
/// Nonce size for AES-256-GCM
const NONCE_SIZE: usize = 12;

#[derive(Clone)]
pub struct CredentialService {
    pool: SqlitePool,
    key: [u8; KEY_SIZE],
}

/// Decrypted credential handed to the backup orchestrator
#[derive(Debug, Clone)]
pub struct DecryptedCredential {
    pub vcenter_host: String,
    pub username: String,
    pub password: String,
}

impl CredentialService {
    /// Build the service with the master key from `SKYBRIDGE_MASTER_KEY`
    /// (hex). Without one, an ephemeral key is generated; stored secrets
    /// then survive only until restart.
    pub fn new(pool: SqlitePool) -> Result<Self> {
        let key = match std::env::var("SKYBRIDGE_MASTER_KEY") {
            Ok(hex_key) => decode_key(&hex_key)?,
            Err(_) => {
                warn!("SKYBRIDGE_MASTER_KEY not set; using an ephemeral encryption key");
                let mut key = [0u8; KEY_SIZE];
                rand::thread_rng().fill(&mut key);
                key
            }
        };

        Ok(Self { pool, key })
    }

    pub fn with_key(pool: SqlitePool, key: [u8; KEY_SIZE]) -> Self {
        Self { pool, key }
    }

    pub async fn store(
        &self,
        name: &str,
        vcenter_host: &str,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let id = format!("cred-{}", uuid::Uuid::new_v4());
        let now = chrono::Utc::now().timestamp();

        crate::db::credentials::create(
            &self.pool,
            &crate::db::credentials::CredentialRecord {
                id: id.clone(),
                name: name.to_string(),
                vcenter_host: vcenter_host.to_string(),
                username: username.to_string(),
                password_enc: self.encrypt(password)?,
                created_at: now,
                updated_at: now,
            },
        )
        .await?;

        Ok(id)
    }

    /// Resolve and decrypt the credential for a vCenter host
    pub async fn for_host(&self, vcenter_host: &str) -> Result<DecryptedCredential> {
        let record = crate::db::credentials::get_for_host(&self.pool, vcenter_host).await?;
        Ok(DecryptedCredential {
            vcenter_host: record.vcenter_host,
            username: record.username,
            password: self.decrypt(&record.password_enc)?,
        })
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| {
            skybridge_common::Error::System(format!("credential encryption failed: {}", e))
        })?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(hex::encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = hex::decode(encoded).map_err(|e| {
            skybridge_common::Error::System(format!("stored credential is not hex: {}", e))
        })?;

        if combined.len() < NONCE_SIZE {
            return Err(skybridge_common::Error::System(
                "stored credential is truncated".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| {
                skybridge_common::Error::System(format!("credential decryption failed: {}", e))
            })?;

        String::from_utf8(plaintext).map_err(|e| {
            skybridge_common::Error::System(format!("decrypted credential is not UTF-8: {}", e))
        })
    }
}

fn decode_key(hex_key: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(hex_key).map_err(|e| {
        skybridge_common::Error::System(format!("SKYBRIDGE_MASTER_KEY is not hex: {}", e))
    })?;

    bytes.try_into().map_err(|_| {
        skybridge_common::Error::System(format!(
            "SKYBRIDGE_MASTER_KEY must be {} hex-encoded bytes",
            KEY_SIZE
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> CredentialService {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        CredentialService::with_key(db.pool().clone(), [7u8; KEY_SIZE])
    }

    #[tokio::test]
    async fn test_round_trip() {
        let service = service().await;
        service
            .store("lab", "vcenter.lab", "administrator@vsphere.local", "s3cret!")
            .await
            .unwrap();

        let cred = service.for_host("vcenter.lab").await.unwrap();
        assert_eq!(cred.username, "administrator@vsphere.local");
        assert_eq!(cred.password, "s3cret!");
    }

    #[tokio::test]
    async fn test_ciphertext_is_not_plaintext() {
        let service = service().await;
        let enc = service.encrypt("hunter2").unwrap();
        assert!(!enc.contains("hunter2"));
        // Nonce is random, so two encryptions differ
        let enc2 = service.encrypt("hunter2").unwrap();
        assert_ne!(enc, enc2);
        assert_eq!(service.decrypt(&enc).unwrap(), "hunter2");
        assert_eq!(service.decrypt(&enc2).unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let a = CredentialService::with_key(db.pool().clone(), [1u8; KEY_SIZE]);
        let b = CredentialService::with_key(db.pool().clone(), [2u8; KEY_SIZE]);

        let enc = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&enc).is_err());
    }

    #[tokio::test]
    async fn test_missing_host_is_not_found() {
        let service = service().await;
        match service.for_host("nowhere.lab").await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            _ => panic!("expected NotFound"),
        }
    }

    #[test]
    fn test_key_decoding() {
        assert!(decode_key(&"ab".repeat(32)).is_ok());
        assert!(decode_key("xyz").is_err());
        assert!(decode_key(&"ab".repeat(16)).is_err());
    }
}
