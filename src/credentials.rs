use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// AES-256-GCM for credential secrets. Nonce is prepended to the
/// ciphertext; the whole blob is base64.
#[derive(Clone)]
pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    pub fn new(key: &str) -> EngineResult<Self> {
        if key.len() != 32 {
            return Err(EngineError::Crypto(
                "encryption key must be exactly 32 bytes".into(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn from_env() -> EngineResult<Self> {
        let key = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| EngineError::Config("ENCRYPTION_KEY not set".into()))?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&blob))
    }

    pub fn decrypt(&self, encrypted: &str) -> EngineResult<String> {
        let blob = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| EngineError::Crypto(format!("base64 decode failed: {e}")))?;

        if blob.len() < 12 {
            return Err(EngineError::Crypto("invalid encrypted data length".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EngineError::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Crypto(format!("utf-8 conversion failed: {e}")))
    }
}

/// A decrypted per-platform credential: a JSON object of connection
/// fields (host, username, password, ...).
#[derive(Debug, Clone)]
pub struct Credential(Value);

impl Credential {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn u16_field(&self, key: &str) -> Option<u16> {
        self.0.get(key).and_then(Value::as_u64).map(|v| v as u16)
    }
}

/// Decrypts and caches per-platform credentials. One resolver per worker,
/// constructor-injected; the cache is keyed by (user, platform) so nothing
/// leaks across users or concurrent executions.
pub struct CredentialResolver {
    store: Store,
    crypto: CryptoService,
    cache: RwLock<HashMap<(Uuid, String), Credential>>,
}

impl CredentialResolver {
    pub fn new(store: Store, crypto: CryptoService) -> Self {
        Self {
            store,
            crypto,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load + decrypt into the cache. Returns false when the user has no
    /// credential for the platform.
    pub async fn fetch(&self, platform: &str, user_id: Uuid) -> EngineResult<bool> {
        if self
            .cache
            .read()
            .await
            .contains_key(&(user_id, platform.to_string()))
        {
            return Ok(true);
        }

        let Some(secret) = self.store.credential_secret(user_id, platform).await? else {
            return Ok(false);
        };

        let decrypted = self.crypto.decrypt(&secret)?;
        let value: Value = serde_json::from_str(&decrypted)?;

        self.cache
            .write()
            .await
            .insert((user_id, platform.to_string()), Credential(value));
        Ok(true)
    }

    pub async fn get_cached(&self, platform: &str, user_id: Uuid) -> Option<Credential> {
        self.cache
            .read()
            .await
            .get(&(user_id, platform.to_string()))
            .cloned()
    }

    /// `fetch` + `get_cached` in one step, erroring when absent.
    pub async fn require(&self, platform: &str, user_id: Uuid) -> EngineResult<Credential> {
        if !self.fetch(platform, user_id).await? {
            return Err(EngineError::CredentialNotFound {
                platform: platform.to_string(),
                user_id,
            });
        }
        self.get_cached(platform, user_id)
            .await
            .ok_or_else(|| EngineError::CredentialNotFound {
                platform: platform.to_string(),
                user_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let crypto = CryptoService::new("test_key_32_bytes_long_exactly!!").expect("crypto");
        let original = r#"{"host":"imap.example.com","password":"s3cret!"}"#;
        let encrypted = crypto.encrypt(original).expect("encrypt");
        assert_ne!(encrypted, original);
        let decrypted = crypto.decrypt(&encrypted).expect("decrypt");
        assert_eq!(decrypted, original);
    }

    #[test]
    fn rejects_short_keys() {
        assert!(CryptoService::new("short").is_err());
    }

    #[test]
    fn rejects_truncated_blobs() {
        let crypto = CryptoService::new("test_key_32_bytes_long_exactly!!").expect("crypto");
        assert!(crypto.decrypt("AAAA").is_err());
    }

    #[test]
    fn credential_field_accessors() {
        let cred = Credential(serde_json::json!({
            "host": "smtp.example.com",
            "port": 465
        }));
        assert_eq!(cred.str_field("host"), Some("smtp.example.com"));
        assert_eq!(cred.u16_field("port"), Some(465));
        assert_eq!(cred.str_field("missing"), None);
    }
}
