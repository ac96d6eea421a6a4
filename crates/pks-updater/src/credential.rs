//! Encrypted storage for the registry access token.
//!
//! A single secret is kept in a JSON record next to the application data:
//!
//! ```text
//! data_dir/
//! ├── secure-tokens.dat   # {"token": <base64>, "timestamp": <ms>, "method": "platform" | "local"}
//! └── encryption.key      # 32 random bytes, only created for the "local" method
//! ```
//!
//! The platform's own protection primitive is preferred when a
//! [`PlatformProtector`] is supplied and reports itself available. Otherwise the
//! token is sealed with ChaCha20-Poly1305 under a key generated once and kept in
//! `encryption.key`. Sealed payloads are `nonce (12 bytes) || ciphertext || tag`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::UpdateError;

/// Length of the local encryption key in bytes.
const KEY_LEN: usize = 32;
/// Length of the AEAD nonce in bytes.
const NONCE_LEN: usize = 12;
/// Associated data bound to every sealed token.
const TOKEN_AAD: &[u8] = b"puenkaset-updater/registry-token/v1";

/// Known registry token shapes: prefix, body length, and whether `_` is allowed in the body.
const TOKEN_SHAPES: &[(&str, usize, bool)] = &[
    ("ghp_", 36, false),
    ("gho_", 36, false),
    ("ghu_", 36, false),
    ("ghs_", 36, false),
    ("ghr_", 76, false),
    ("github_pat_", 82, true),
];

/// OS-provided secret protection (DPAPI, Keychain, libsecret and the like).
pub trait PlatformProtector: Send + Sync {
    /// Whether the primitive can be used right now.
    fn is_available(&self) -> bool;

    /// Encrypt `plaintext` into an opaque blob.
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, UpdateError>;

    /// Reverse [`PlatformProtector::protect`].
    fn unprotect(&self, ciphertext: &[u8]) -> Result<Vec<u8>, UpdateError>;
}

/// How a stored record was encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMethod {
    Platform,
    Local,
}

/// On-disk credential record.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialRecord {
    token: String,
    timestamp: i64,
    method: ProtectionMethod,
}

/// Persists one registry token encrypted at rest.
pub struct SecureCredentialStore {
    record_path: PathBuf,
    key_path: PathBuf,
    platform: Option<Arc<dyn PlatformProtector>>,
}

impl SecureCredentialStore {
    /// Create a store using the local cipher only.
    pub fn new(record_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            record_path,
            key_path,
            platform: None,
        }
    }

    /// Prefer the given platform primitive when it is available.
    pub fn with_platform_protector(mut self, protector: Arc<dyn PlatformProtector>) -> Self {
        self.platform = Some(protector);
        self
    }

    /// Path of the encrypted record.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Encrypt and persist `secret`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty secret.
    pub fn store(&self, secret: &str) -> Result<(), UpdateError> {
        if secret.trim().is_empty() {
            return Err(UpdateError::InvalidInput("token must not be empty".to_string()));
        }

        let (method, sealed) = match self.available_platform() {
            Some(platform) => (ProtectionMethod::Platform, platform.protect(secret.as_bytes())?),
            None => {
                let key = self.load_or_generate_key()?;
                (ProtectionMethod::Local, seal(&key, secret.as_bytes())?)
            }
        };

        let record = CredentialRecord {
            token: STANDARD.encode(sealed),
            timestamp: chrono::Utc::now().timestamp_millis(),
            method,
        };
        write_atomic(&self.record_path, &serde_json::to_vec(&record)?)?;
        info!("Stored registry token ({:?} encryption)", method);
        Ok(())
    }

    /// Decrypt the stored secret.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when no record exists.
    ///
    /// # Errors
    ///
    /// Returns `DecryptionError` when the record is corrupt or was written with a
    /// method that is not available now.
    pub fn retrieve(&self) -> Result<Option<String>, UpdateError> {
        let raw = match fs::read(&self.record_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CredentialRecord = serde_json::from_slice(&raw)
            .map_err(|e| UpdateError::DecryptionError(format!("malformed record: {}", e)))?;
        if record.token.is_empty() {
            return Ok(None);
        }

        let sealed = STANDARD
            .decode(record.token.as_bytes())
            .map_err(|e| UpdateError::DecryptionError(format!("invalid encoding: {}", e)))?;

        let plaintext = match record.method {
            ProtectionMethod::Platform => {
                let platform = self.available_platform().ok_or_else(|| {
                    UpdateError::DecryptionError(
                        "record uses platform encryption, which is not available".to_string(),
                    )
                })?;
                platform
                    .unprotect(&sealed)
                    .map_err(|e| UpdateError::DecryptionError(e.to_string()))?
            }
            ProtectionMethod::Local => {
                let key = self.load_key()?;
                open(&key, &sealed)?
            }
        };

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| UpdateError::DecryptionError("token is not valid UTF-8".to_string()))
    }

    /// Delete the record. Missing records are not an error.
    pub fn remove(&self) -> Result<(), UpdateError> {
        match fs::remove_file(&self.record_path) {
            Ok(()) => {
                info!("Removed stored registry token");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a record is present on disk.
    pub fn has_token(&self) -> bool {
        self.record_path.exists()
    }

    /// Check `candidate` against the registry's known token shapes.
    pub fn validate_format(candidate: &str) -> bool {
        TOKEN_SHAPES.iter().any(|(prefix, len, underscore)| {
            candidate.strip_prefix(prefix).map_or(false, |body| {
                body.len() == *len
                    && body
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || (*underscore && b == b'_'))
            })
        })
    }

    fn available_platform(&self) -> Option<&Arc<dyn PlatformProtector>> {
        self.platform.as_ref().filter(|p| p.is_available())
    }

    fn load_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, UpdateError> {
        let bytes = Zeroizing::new(fs::read(&self.key_path).map_err(|e| {
            UpdateError::DecryptionError(format!("cannot read encryption key: {}", e))
        })?);
        if bytes.len() != KEY_LEN {
            return Err(UpdateError::DecryptionError(format!(
                "encryption key has {} bytes, expected {}",
                bytes.len(),
                KEY_LEN
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    fn load_or_generate_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, UpdateError> {
        if self.key_path.exists() {
            return self.load_key();
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        write_atomic(&self.key_path, &key[..])?;
        debug!("Generated local encryption key at {:?}", self.key_path);
        Ok(key)
    }
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, UpdateError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = aead
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: TOKEN_AAD,
            },
        )
        .map_err(|_| UpdateError::InvalidInput("token encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, UpdateError> {
    if sealed.len() <= NONCE_LEN {
        return Err(UpdateError::DecryptionError("sealed token too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    aead.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad: TOKEN_AAD,
        },
    )
    .map_err(|_| UpdateError::DecryptionError("authentication tag mismatch".to_string()))
}

/// Write via a temp file and rename so readers never see a torn record.
///
/// On unix the temp file is created with mode 0600, so the contents are
/// never readable by other users.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), UpdateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    // A leftover temp file would keep its old mode.
    match fs::remove_file(&tmp) {
        Ok(()) => debug!("Removed stale {:?}", tmp),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}
