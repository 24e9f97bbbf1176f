//! Preshared key storage.
//!
//! The keyring maps principal names to 256-bit preshared keys. On disk
//! it is a line-oriented file of `principal hex-key` pairs; blank lines
//! and `#` comments are ignored. Key material is zeroized on drop and
//! redacted from Debug output.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a preshared key in bytes.
pub const KEY_LEN: usize = 32;

/// A 256-bit preshared key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Creates a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a hex-encoded key.
    ///
    /// # Errors
    ///
    /// Returns `KeyringError::InvalidKey` if the input is not exactly
    /// [`KEY_LEN`] bytes of hex.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyringError> {
        let raw = hex::decode(encoded).map_err(|_| KeyringError::InvalidKey {
            reason: "key is not valid hex".to_string(),
        })?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| KeyringError::InvalidKey {
            reason: format!("key must be {KEY_LEN} bytes"),
        })?;
        Ok(Self(bytes))
    }

    /// Generates a random key from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub(crate) const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Returns the hex encoding, for writing keyring files.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretKey").field(&"[REDACTED]").finish()
    }
}

/// Error type for keyring loading.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Keyring file could not be read.
    #[error("cannot read keyring {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A line did not parse as `principal hex-key`.
    #[error("keyring line {line}: {reason}")]
    Parse {
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        reason: String,
    },

    /// A key value was rejected.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Description of the problem.
        reason: String,
    },
}

/// Mapping from principal names to preshared keys.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: HashMap<String, SecretKey>,
}

impl Keyring {
    /// Creates an empty keyring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a keyring file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line does not
    /// parse.
    pub fn from_file(path: &Path) -> Result<Self, KeyringError> {
        let content = std::fs::read_to_string(path).map_err(|source| KeyringError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses keyring content.
    ///
    /// # Errors
    ///
    /// Returns `KeyringError::Parse` for lines that are not
    /// `principal hex-key` pairs.
    pub fn parse(content: &str) -> Result<Self, KeyringError> {
        let mut keyring = Self::new();
        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(principal), Some(encoded), None) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(KeyringError::Parse {
                    line: index + 1,
                    reason: "expected 'principal hex-key'".to_string(),
                });
            };
            let key = SecretKey::from_hex(encoded).map_err(|e| KeyringError::Parse {
                line: index + 1,
                reason: e.to_string(),
            })?;
            keyring.insert(principal, key);
        }
        Ok(keyring)
    }

    /// Adds or replaces a principal's key.
    pub fn insert(&mut self, principal: impl Into<String>, key: SecretKey) {
        self.keys.insert(principal.into(), key);
    }

    /// Looks up a principal's key.
    #[must_use]
    pub fn lookup(&self, principal: &str) -> Option<&SecretKey> {
        self.keys.get(principal)
    }

    /// Returns the number of principals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no principals are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_keyring() {
        let alice = SecretKey::generate();
        let bob = SecretKey::generate();
        let content = format!(
            "# test keyring\n\nalice {}\nbob {}\n",
            alice.to_hex(),
            bob.to_hex()
        );

        let keyring = Keyring::parse(&content).unwrap();
        assert_eq!(keyring.len(), 2);
        assert_eq!(keyring.lookup("alice"), Some(&alice));
        assert_eq!(keyring.lookup("bob"), Some(&bob));
        assert!(keyring.lookup("mallory").is_none());
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        let err = Keyring::parse("alice\n").unwrap_err();
        assert!(matches!(err, KeyringError::Parse { line: 1, .. }));

        let err = Keyring::parse("alice deadbeef\n").unwrap_err();
        assert!(matches!(err, KeyringError::Parse { line: 1, .. }));

        let err = Keyring::parse("alice aa bb\n").unwrap_err();
        assert!(matches!(err, KeyringError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_from_file() {
        let key = SecretKey::generate();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "service {}", key.to_hex()).unwrap();

        let keyring = Keyring::from_file(file.path()).unwrap();
        assert_eq!(keyring.lookup("service"), Some(&key));
    }

    #[test]
    fn test_from_file_missing() {
        let err = Keyring::from_file(Path::new("/nonexistent/keyring")).unwrap_err();
        assert!(matches!(err, KeyringError::Io { .. }));
    }

    #[test]
    fn test_hex_round_trip() {
        let key = SecretKey::generate();
        let parsed = SecretKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = SecretKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&key.to_hex()));
    }
}
