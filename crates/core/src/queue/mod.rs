//! Export scheduling queue.

pub mod ports;
pub mod service;

pub use ports::{ExportQueueRepository, HouseProviderResolver};
pub use service::ExportQueue;
