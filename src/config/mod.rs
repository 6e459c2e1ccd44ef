//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ResilienceConfig (validated, immutable)
//!     → consumed once by lifecycle::startup to build the context
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ResilienceConfig;
pub use schema::HealthCheckSettings;
pub use schema::CircuitBreakerSettings;
pub use schema::RetrySettings;
pub use schema::ServicePolicyConfig;
pub use schema::BulkheadPoolConfig;
pub use loader::{load_config, ConfigError};
