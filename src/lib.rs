//! Geofence-driven work session tracking core: an adaptive geofence state
//! machine with TTL-based pending-action resolution and hysteresis, plus the
//! local persistence it decides against.

pub mod db;
pub mod geo;
pub mod geofence;
pub mod models;
pub mod ports;
pub mod utils;

pub use db::Database;
pub use geofence::{
    ControllerSettings, GeofenceConfig, GeofenceController, GeofenceMonitor, HeartbeatScheduler,
    TtlOutcome,
};
