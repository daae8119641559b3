//! Lease-based distributed locking backed by the config store.

pub mod catalog;
pub mod manager;

pub use catalog::{
    ConfigServerInfo, DistLockCatalog, InMemoryDistLockCatalog, LockDocument, LockState,
    PingDocument,
};
pub use manager::{ReplSetDistLockManager, ScopedDistLock};
