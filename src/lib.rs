//! Service discovery and fault tolerance for networked services.
//!
//! A process registers its own instances, discovers healthy instances of its
//! dependencies, and calls them through a configurable stack of timeout,
//! bulkhead, retry, circuit breaker and fallback layers.

pub mod admin;
pub mod config;
pub mod discovery;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;

pub use config::schema::ResilienceConfig;
pub use discovery::{Registration, ServiceDiscovery, ServiceInstance};
pub use lifecycle::{ResilienceContext, Shutdown};
pub use resilience::{ExecuteOptions, FaultToleranceManager, ResilienceError};
