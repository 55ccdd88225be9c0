//! Coordinator: the REST-facing control plane of the proxy system.
//! Owns the Slot Ledger, Circuit Registry, Worker Selector, and
//! Token Vault, and runs the idle-TTL sweeper for inference circuits.

pub mod api;
pub mod authn;
pub mod circuit_registry;
pub mod config;
pub mod slot_ledger;
pub mod state;
pub mod sweeper;
pub mod telemetry;
pub mod token_vault;
pub mod worker_selector;
