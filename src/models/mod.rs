mod heartbeat;
mod location;
mod pending;
mod session;
mod site;

pub use heartbeat::{HeartbeatState, IntervalReason};
pub use location::GpsFix;
pub use pending::{GpsSnapshot, PendingAction, PendingKind};
pub use session::{SessionOrigin, WorkSession};
pub use site::{SiteLimits, SiteStatus, WorkSite};
