//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! FaultToleranceManager::execute(service, op):
//!     → fallback.rs        (substitute result if everything below failed)
//!     → circuit_breaker.rs (reject while Open, one outcome per execute)
//!     → retries.rs         (re-run with backoff.rs delays)
//!     → bulkhead.rs        (non-blocking permit from a named pool)
//!     → timeouts.rs        (deadline around the call)
//!     → op
//! Final failure → failure_detector.rs (record, classify, escalate)
//! ```
//!
//! # Design Decisions
//! - Layering order is fixed; a service only chooses which layers are on
//! - Errors keep the caller's type in `ResilienceError::Inner`
//! - Counters live next to each layer and are gathered by `system_status()`

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod error;
pub mod failure_detector;
pub mod fallback;
pub mod manager;
pub mod retries;
pub mod timeouts;

pub use bulkhead::{BulkheadError, BulkheadManager, BulkheadPermit, PoolStats, ResourcePool};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use error::ResilienceError;
pub use failure_detector::{
    Escalation, FailureDetector, FailureQuery, FailureRecord, FailureStatistics, FailureType,
};
pub use fallback::{FallbackHandler, FallbackManager, FallbackStats};
pub use manager::{ExecuteOptions, FaultToleranceManager, RequestStats, ServicePolicy, Strategy, SystemStatus};
pub use retries::{RetryManager, RetryPolicy, RetryStats};
pub use timeouts::TimeoutManager;
