//! # Regsync Domain
//!
//! Data model for keeping a housing back office in sync with the external
//! registry.
//!
//! This crate contains:
//! - Correlation records, export queue entries and operation records
//! - Registry request/response shapes
//! - The registry error taxonomy and control signals
//! - Configuration structures and domain constants
//!
//! ## Architecture
//! - Depends only on `regsync-common` for error classification
//! - No I/O

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod signals;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use signals::{ControlSignal, ExternalBusinessError, PublicError, RegistryError};
pub use types::*;
