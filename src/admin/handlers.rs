use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::admin::AdminState;
use crate::discovery::{DiscoveryError, InstanceStatus, ServiceInstance};
use crate::health::{HealthReport, HealthStatus};
use crate::load_balancer::Strategy;
use crate::resilience::{CircuitBreakerSnapshot, FailureQuery, FailureRecord, SystemStatus};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Discovery(DiscoveryError::InvalidInstance(_)) => StatusCode::BAD_REQUEST,
            AdminError::Discovery(DiscoveryError::ServiceUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AdminError::Discovery(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

#[derive(Serialize)]
pub struct NodeStatus {
    pub version: &'static str,
    pub status: HealthStatus,
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    pub health: HealthReport,
}

#[derive(Serialize)]
pub struct ServiceView {
    pub name: String,
    pub strategy: Strategy,
    pub instances: Vec<ServiceInstance>,
    pub healthy: usize,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterInstanceRequest {
    /// Generated from the service name when absent.
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterInstanceResponse {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusUpdateRequest {
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

pub async fn get_status(State(state): State<AdminState>) -> AdminResult<Json<NodeStatus>> {
    let services = state.discovery.registry().all_services().await?;
    let instances = services.values().map(Vec::len).sum();
    let healthy_instances = services
        .values()
        .flatten()
        .filter(|i| i.is_healthy())
        .count();
    let health = state.fault_tolerance.monitor().status();

    Ok(Json(NodeStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: health.overall_status,
        services: services.len(),
        instances,
        healthy_instances,
        health,
    }))
}

pub async fn get_services(
    State(state): State<AdminState>,
) -> AdminResult<Json<HashMap<String, Vec<ServiceInstance>>>> {
    Ok(Json(state.discovery.registry().all_services().await?))
}

pub async fn get_service(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> AdminResult<Json<ServiceView>> {
    let instances = state.discovery.discover_all(&name).await?;
    let healthy = instances.iter().filter(|i| i.is_healthy()).count();
    let circuit_breaker = state
        .fault_tolerance
        .system_status()
        .circuit_breakers
        .remove(&name);

    Ok(Json(ServiceView {
        strategy: state.discovery.balancer().strategy_for(&name),
        name,
        instances,
        healthy,
        circuit_breaker,
    }))
}

pub async fn register_instance(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<RegisterInstanceRequest>,
) -> AdminResult<(StatusCode, Json<RegisterInstanceResponse>)> {
    let id = body.id.unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", name, &suffix[..8])
    });

    let mut instance = ServiceInstance::new(&id, &name, &body.host, body.port).with_tags(body.tags);
    instance.metadata = body.metadata;
    if let Some(weight) = body.weight {
        instance = instance.with_weight(weight);
    }

    let check = match body.health_check_url {
        Some(url) => {
            instance = instance.with_health_check_url(url.clone());
            Some(state.discovery.default_check(url))
        }
        None => {
            instance = instance.with_status(InstanceStatus::Healthy);
            None
        }
    };

    let created = state.discovery.registry().register(instance, check).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(RegisterInstanceResponse { id, created })))
}

pub async fn deregister_instance(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<StatusCode> {
    if state.discovery.registry().deregister(&id).await? {
        state.discovery.balancer().connections().forget(&id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound(format!("instance '{}' not found", id)))
    }
}

pub async fn update_instance_status(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateRequest>,
) -> AdminResult<StatusCode> {
    if state
        .discovery
        .registry()
        .update_status(&id, body.status, body.metadata)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::NotFound(format!("instance '{}' not found", id)))
    }
}

pub async fn get_resilience(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(state.fault_tolerance.system_status())
}

pub async fn get_failures(
    State(state): State<AdminState>,
    Query(query): Query<FailureQuery>,
) -> Json<Vec<FailureRecord>> {
    Json(state.fault_tolerance.detector().failures(&query))
}

pub async fn resolve_failure(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> AdminResult<Json<serde_json::Value>> {
    if state.fault_tolerance.detector().resolve_failure(&id) {
        Ok(Json(serde_json::json!({ "id": id, "resolved": true })))
    } else {
        Err(AdminError::NotFound(format!(
            "failure '{}' not found or already resolved",
            id
        )))
    }
}
