//! Storage primitives for encrypted databases

pub mod error;
pub mod sqlcipher;

pub use error::{StorageError, StorageResult};
pub use sqlcipher::{PoolHealth, SqlCipherConnection, SqlCipherPool, SqlCipherPoolConfig};
