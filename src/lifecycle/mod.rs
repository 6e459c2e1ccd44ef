//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Build discovery + fault tolerance → Spawn background loops
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast to loops → Await tasks → Deregister own instances
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One explicit context object instead of process-wide singletons
//! - Ordered startup: config first, then registry, then background loops
//! - Shutdown has a deadline: loops still running after it are abandoned

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{ResilienceContext, StartupError};
