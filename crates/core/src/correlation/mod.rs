//! Correlation store: local object identity to registry identity.

pub mod ports;
pub mod service;

pub use ports::CorrelationRepository;
pub use service::CorrelationStore;
