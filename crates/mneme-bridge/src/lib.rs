//! mneme-bridge: process-backed JSON-lines RPC between a UI process and a
//! long-lived worker.

mod health;

pub mod actions;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod service;
pub mod supervisor;

pub use actions::Action;
pub use config::{BridgeConfig, CorrelationMode, WorkerCommand};
pub use error::{BridgeError, Result};
pub use health::{BridgeStatus, ProcessState};
pub use service::Bridge;
pub use supervisor::{CommandSpawner, SpawnError, WorkerSpawner};
