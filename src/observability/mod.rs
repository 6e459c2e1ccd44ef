//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Registry, health checker, load balancer and fault-tolerance wrappers produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Components call the narrow `metrics::record_*` functions, never the exporter
//! - Without an installed recorder every metric call is a no-op
//! - Log fields carry `service`, `instance_id` and `operation` consistently

pub mod logging;
pub mod metrics;
