//! AES-256-GCM encryption for exchange credentials at rest.
//!
//! Key material lives in a single file under the data directory, created
//! with owner-only permissions on first run. Ciphertext is
//! `base64(nonce || aes_gcm(plaintext))`. Decryption failure is treated as
//! legacy plaintext (pre-encryption rows) rather than an error, per the
//! account store's compatibility contract.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const NONCE_LEN: usize = 12;
const KEY_FILE_NAME: &str = "secret.key";

pub struct Crypto {
    cipher: Aes256Gcm,
}

impl Crypto {
    /// Loads the key from `<data_dir>/secret.key`, generating one with
    /// `0600` permissions if absent.
    pub fn load_or_generate(data_dir: &str) -> Result<Self> {
        let path = key_path(data_dir);
        let key_bytes = if path.exists() {
            std::fs::read(&path).with_context(|| format!("failed to read key file {:?}", path))?
        } else {
            let key = Aes256Gcm::generate_key(&mut OsRng);
            write_key_file(&path, &key)?;
            info!("🔐 generated new credential encryption key at {:?}", path);
            key.to_vec()
        };
        anyhow::ensure!(key_bytes.len() == 32, "secret key must be 32 bytes");
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Returns the plaintext, or the input unchanged (with a warning) if it
    /// cannot be decrypted — covers rows written before encryption was
    /// enabled.
    pub fn decrypt_or_legacy(&self, stored: &str) -> String {
        match self.try_decrypt(stored) {
            Ok(plain) => plain,
            Err(_) => {
                warn!("credential value is not valid ciphertext, treating as legacy plaintext");
                stored.to_string()
            }
        }
    }

    fn try_decrypt(&self, stored: &str) -> Result<String> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(stored)
            .context("not valid base64")?;
        anyhow::ensure!(combined.len() > NONCE_LEN, "ciphertext too short");
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;
        String::from_utf8(plaintext).context("decrypted payload is not utf8")
    }
}

fn key_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(KEY_FILE_NAME)
}

#[cfg(unix)]
fn write_key_file(path: &Path, key: &[u8]) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create key file {:?}", path))?;
    file.write_all(key)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_key_file(path: &Path, key: &[u8]) -> Result<()> {
    std::fs::write(path, key).with_context(|| format!("failed to create key file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Crypto::load_or_generate(dir.path().to_str().unwrap()).unwrap();
        let secret = "super-secret-api-key";
        let encrypted = crypto.encrypt(secret).unwrap();
        assert_ne!(encrypted, secret);
        assert_eq!(crypto.decrypt_or_legacy(&encrypted), secret);
    }

    #[test]
    fn legacy_plaintext_falls_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = Crypto::load_or_generate(dir.path().to_str().unwrap()).unwrap();
        let legacy = "plain-old-api-key";
        assert_eq!(crypto.decrypt_or_legacy(legacy), legacy);
    }

    #[test]
    fn reloading_key_file_decrypts_previously_encrypted_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = Crypto::load_or_generate(path).unwrap();
        let encrypted = first.encrypt("rotate-me").unwrap();

        let second = Crypto::load_or_generate(path).unwrap();
        assert_eq!(second.decrypt_or_legacy(&encrypted), "rotate-me");
    }
}
