//! Registry transport over HTTP

pub mod errors;
pub mod transport;

pub use errors::{classify_status, RegistryErrorCategory};
pub use transport::HttpRegistryTransport;
