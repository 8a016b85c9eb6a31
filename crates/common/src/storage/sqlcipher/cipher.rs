//! SQLCipher key and cipher pragmas.

use rusqlite::Connection;
use tracing::{debug, error};

use crate::storage::error::{StorageError, StorageResult};

/// Markers SQLite/SQLCipher put in the message when the key does not match.
const WRONG_KEY_MARKERS: &[&str] = &[
    "file is not a database",
    "file is encrypted",
    "database disk image is malformed",
    "notadb",
    "unsupported file format",
];

/// SQLCipher configuration
#[derive(Clone)]
pub struct SqlCipherConfig {
    key: String,

    /// Cipher compatibility version (4 for SQLCipher 4.x)
    pub cipher_compatibility: i32,

    /// KDF iterations for key derivation
    pub kdf_iter: i32,
}

impl std::fmt::Debug for SqlCipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCipherConfig")
            .field("key", &"***")
            .field("cipher_compatibility", &self.cipher_compatibility)
            .field("kdf_iter", &self.kdf_iter)
            .finish()
    }
}

impl SqlCipherConfig {
    /// Default SQLCipher 4 settings with the given key.
    pub fn new(key: String) -> Self {
        Self { key, cipher_compatibility: 4, kdf_iter: 256_000 }
    }
}

/// Apply the encryption key and cipher settings.
///
/// Must run before any other statement on a freshly opened connection.
pub fn configure_sqlcipher(conn: &Connection, config: &SqlCipherConfig) -> StorageResult<()> {
    conn.pragma_update(None, "key", &config.key).map_err(|e| {
        error!(error = %e, "SQLCipher key setup failed");
        classify_key_error(&e)
            .unwrap_or_else(|| StorageError::Encryption(format!("Failed to set key: {e}")))
    })?;

    conn.pragma_update(None, "cipher_compatibility", config.cipher_compatibility).map_err(|e| {
        StorageError::Encryption(format!("Failed to set cipher_compatibility: {e}"))
    })?;

    conn.pragma_update(None, "kdf_iter", config.kdf_iter)
        .map_err(|e| StorageError::Encryption(format!("Failed to set kdf_iter: {e}")))?;

    debug!("SQLCipher configuration applied");
    Ok(())
}

/// Force a page read so a wrong key fails at pool creation, not first query.
pub fn verify_encryption(conn: &Connection) -> StorageResult<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(())).map_err(|e| {
        error!(error = %e, "Encryption verification failed");
        classify_key_error(&e).unwrap_or_else(|| StorageError::from(e))
    })
}

/// Map wrong-key symptoms to [`StorageError::WrongKeyOrNotEncrypted`].
pub(crate) fn classify_message(message: &str) -> Option<StorageError> {
    let lower = message.to_lowercase();
    WRONG_KEY_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        .then_some(StorageError::WrongKeyOrNotEncrypted)
}

fn classify_key_error(err: &rusqlite::Error) -> Option<StorageError> {
    classify_message(&err.to_string())
}
