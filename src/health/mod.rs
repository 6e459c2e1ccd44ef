//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Instance health checks (active.rs):
//!     Periodic tick
//!     → Probe each due instance (HTTP GET, bounded timeout)
//!     → Registry::update_status on transitions only
//!     → Registry::deregister once unhealthy past the window
//!
//! Process health monitor (monitor.rs):
//!     Periodic tick
//!     → Run each due boolean probe
//!     → Update per-check results (state.rs)
//!
//! Aggregation (state.rs):
//!     Healthy / Degraded / Critical
//! ```
//!
//! # Design Decisions
//! - Instance checks and process probes are independent loops
//! - Status changes are edge-triggered: only transitions are logged and notified
//! - A probe failure never stops a loop; it is recorded and the next tick proceeds

pub mod active;
pub mod monitor;
pub mod state;

pub use active::{HealthChecker, HttpProbe, Probe, ProbeOutcome};
pub use monitor::{HealthMonitor, HealthProbe, ProbeError};
pub use state::{HealthCheckResult, HealthReport, HealthStatus};
