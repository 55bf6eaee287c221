pub mod config;
pub mod controller;
pub mod evaluator;
pub mod guard;
pub mod pending;
pub mod pingpong;
pub mod runner;
pub mod scheduler;

pub use config::GeofenceConfig;
pub use controller::{ControllerSettings, GeofenceController, TtlOutcome};
pub use evaluator::{Containment, GeofenceEvaluator};
pub use pending::{resolve_expired, PendingActionManager, Resolution};
pub use runner::GeofenceMonitor;
pub use scheduler::HeartbeatScheduler;
