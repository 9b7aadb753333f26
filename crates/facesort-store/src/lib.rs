//! facesort-store — Durable per-directory person registries.
//!
//! Loads registries fail-open with schema migration, and saves them with
//! write-then-rename under an advisory `flock` lock.

pub mod lock;
pub mod registry;

pub use lock::{LockPolicy, RegistryLock};
pub use registry::{RegistryStore, StoreError, REGISTRY_FILE};
