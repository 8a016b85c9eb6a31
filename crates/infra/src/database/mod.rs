//! SQLCipher-backed implementations of the persistence ports

mod columns;
pub mod correlation_repository;
pub mod export_queue_repository;
pub mod house_provider_repository;
pub mod manager;
pub mod object_lock_repository;
pub mod operation_repository;

pub use correlation_repository::SqlCipherCorrelationRepository;
pub use export_queue_repository::SqlCipherExportQueueRepository;
pub use house_provider_repository::SqlCipherHouseProviderRepository;
pub use manager::{DbManager, SCHEMA_VERSION};
pub use object_lock_repository::SqlCipherObjectLock;
pub use operation_repository::SqlCipherOperationRepository;
