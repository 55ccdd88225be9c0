//! Shared domain types for the AppProxy coordinator and worker.
//!
//! This crate has no I/O of its own: it defines the wire/store-shape
//! structs (`Worker`, `Slot`, `Circuit`, `RouteInfo`, `Endpoint`, tokens),
//! the error taxonomy shared by both processes, and the fingerprinting
//! used for interactive-circuit reuse.

pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod model;
pub mod telemetry;

pub mod prelude {
	pub use crate::error::{ApiError, ErrorCode};
	pub use crate::model::*;
	pub use arcstr::ArcStr;
	pub use std::sync::Arc;
	pub use std::time::Duration;
	pub use tracing::{debug, error, info, trace, warn};
}
