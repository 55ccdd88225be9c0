//! The persistent-store adapter. This crate treats the key-value store as a narrow external
//! dependency: get/put/delete/watch, atomic create-if-absent (used for
//! slot reservation and fingerprint locks), and a pub/sub event bus.
//!
//! [`memory::MemoryStore`] backs coordinator/worker integration tests
//! without a live etcd cluster; [`etcd::EtcdStore`] is the production
//! adapter.

pub mod error;
pub mod etcd;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod typed;

pub use error::StoreError;
pub use kv::{EventBus, KvStore};
