//! Admin HTTP surface.
//!
//! # Data Flow
//! ```text
//! Request → TraceLayer → auth.rs (bearer key) → handlers.rs
//!     → ServiceDiscovery / FaultToleranceManager → JSON
//! ```
//!
//! # Design Decisions
//! - Read endpoints expose the statistics surface as-is
//! - Mutations are limited to registry membership and failure resolution
//! - Every route requires `Authorization: Bearer <api_key>`

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::discovery::ServiceDiscovery;
use crate::lifecycle::ResilienceContext;
use crate::resilience::FaultToleranceManager;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state of the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub discovery: Arc<ServiceDiscovery>,
    pub fault_tolerance: Arc<FaultToleranceManager>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn from_context(ctx: &ResilienceContext) -> Self {
        Self {
            discovery: ctx.discovery().clone(),
            fault_tolerance: ctx.fault_tolerance().clone(),
            api_key: Arc::from(ctx.config().admin.api_key.as_str()),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(get_services))
        .route("/admin/services/{name}", get(get_service))
        .route("/admin/services/{name}/instances", post(register_instance))
        .route("/admin/instances/{id}", delete(deregister_instance))
        .route("/admin/instances/{id}/status", put(update_instance_status))
        .route("/admin/resilience", get(get_resilience))
        .route("/admin/failures", get(get_failures))
        .route("/admin/failures/{id}/resolve", post(resolve_failure))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
