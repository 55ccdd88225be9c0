pub mod admission;
pub mod agent;
pub mod api;
pub mod config;
pub mod coordinator_client;
pub mod frontend;
pub mod inference_router;
pub mod pool;
pub mod state;
pub mod telemetry;
