//! Transport-agnostic API surface.
//!
//! [`Gateway::handle`] maps `(method, path, query, account, body)` onto the
//! services and returns a status code plus a JSON body. An HTTP or RPC layer
//! only has to translate its own request type into an [`ApiRequest`].
//!
//! Synchronous rejections come back as 4xx before anything is queued. A job
//! that was accepted and later failed is a 200 on `GET /jobs/{id}` with
//! `status: "failed"`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use world_engine::{ComponentType, EntityId, RegionId};

use crate::error::MeshError;
use crate::events::{EventBus, MeshEvent};
use crate::orchestrator::{CancelOutcome, JobError, JobId, JobRequest, JobStatus, Orchestrator};
use crate::policy::{AccountId, PolicyGate};
use crate::registry::{Heartbeat, NodeDescriptor, NodeFilter, NodeId, NodeRegistry};
use crate::world_service::WorldService;

/// A rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    /// The same request may succeed later.
    #[serde(default)]
    pub retryable: bool,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }
}

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        let status = match &e {
            MeshError::Validation(_) => 400,
            MeshError::PolicyDenied(_) => 403,
            MeshError::NotFound { .. } => 404,
            MeshError::Connectivity(_) => 503,
            MeshError::ExecutionTimeout(_) => 504,
            MeshError::Execution(_) => 502,
            MeshError::World(_) | MeshError::Config(_) => 500,
        };
        Self {
            retryable: e.is_retryable(),
            ..Self::new(status, e.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// One inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Caller identity, required for mutating job and world calls.
    #[serde(default)]
    pub account: Option<AccountId>,
    #[serde(default)]
    pub body: Value,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            account: None,
            body: Value::Null,
        }
    }

    pub fn with_account(mut self, account: impl Into<AccountId>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Status code and JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn created(body: Value) -> Self {
        Self { status: 201, body }
    }
}

impl From<ApiError> for ApiResponse {
    fn from(e: ApiError) -> Self {
        Self {
            status: e.status,
            body: json!({ "error": e.message, "retryable": e.retryable }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub account_id: AccountId,
    pub consent_type: String,
    pub granted: bool,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntityRequest {
    pub entity_type: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetActiveRequest {
    pub active: bool,
}

/// Public view of a job for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub retry_count: u32,
}

/// Request handlers over the mesh services.
pub struct Gateway {
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<Orchestrator>,
    gate: Arc<PolicyGate>,
    world: Arc<WorldService>,
    events: EventBus,
}

impl Gateway {
    pub fn new(
        registry: Arc<NodeRegistry>,
        orchestrator: Arc<Orchestrator>,
        gate: Arc<PolicyGate>,
        world: Arc<WorldService>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            gate,
            world,
            events,
        }
    }

    /// The push/subscribe channel for status and job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Route one request. Never fails; errors become 4xx/5xx responses.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        debug!(method = %request.method, path = %request.path, "api request");
        match self.route(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(status = e.status, error = %e.message, "api request rejected");
                e.into()
            }
        }
    }

    async fn route(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
        let segments: Vec<&str> = request
            .path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        use Method::*;
        match (request.method, segments.as_slice()) {
            (Post, ["nodes"]) => {
                let descriptor: NodeDescriptor = parse_body(&request.body)?;
                let node_id = self.registry.register(descriptor)?;
                Ok(ApiResponse::created(json!({ "node_id": node_id })))
            }
            (Get, ["nodes"]) => {
                let filter = NodeFilter {
                    service_type: request.query.get("service_type").cloned(),
                    capability: request.query.get("capability").cloned(),
                };
                Ok(ApiResponse::ok(to_json(self.registry.discover(&filter))?))
            }
            (Get, ["nodes", id]) => {
                let node = self.registry.get(parse_id::<NodeId>("node", id)?)?;
                Ok(ApiResponse::ok(to_json(node)?))
            }
            (Delete, ["nodes", id]) => {
                self.registry.deregister(parse_id::<NodeId>("node", id)?)?;
                Ok(ApiResponse::ok(json!({ "deregistered": true })))
            }
            (Post, ["nodes", id, "heartbeat"]) => {
                let node_id = parse_id::<NodeId>("node", id)?;
                let heartbeat: Heartbeat = match &request.body {
                    Value::Null => Heartbeat::healthy(),
                    body => parse_body(body)?,
                };
                let status = self.registry.heartbeat(node_id, heartbeat)?;
                Ok(ApiResponse::ok(json!({ "status": status })))
            }
            (Get, ["mesh", "health"]) => Ok(ApiResponse::ok(to_json(self.registry.health())?)),

            (Post, ["jobs"]) => {
                let account = require_account(request)?;
                let job: JobRequest = parse_body(&request.body)?;
                let job_id = self.orchestrator.submit(account, job)?;
                Ok(ApiResponse::created(json!({ "job_id": job_id })))
            }
            (Get, ["jobs"]) => {
                let status = match request.query.get("status") {
                    Some(s) => Some(parse_body::<JobStatus>(&Value::String(s.clone()))?),
                    None => None,
                };
                let jobs: Vec<JobView> = self
                    .orchestrator
                    .list(status)
                    .into_iter()
                    .map(JobView::from)
                    .collect();
                Ok(ApiResponse::ok(to_json(jobs)?))
            }
            (Get, ["jobs", "stats"]) => Ok(ApiResponse::ok(to_json(self.orchestrator.stats())?)),
            (Get, ["jobs", id]) => {
                let job = self.orchestrator.get(parse_id::<JobId>("job", id)?)?;
                Ok(ApiResponse::ok(to_json(JobView::from(job))?))
            }
            (Post, ["jobs", id, "cancel"]) => {
                let account = require_account(request)?;
                let outcome = self
                    .orchestrator
                    .cancel(account, parse_id::<JobId>("job", id)?)
                    .await?;
                let body = match outcome {
                    CancelOutcome::Removed => json!({ "cancelled": true, "was": "pending" }),
                    CancelOutcome::Forwarded => json!({ "cancelled": true, "was": "running" }),
                    CancelOutcome::TooLate => json!({ "cancelled": false, "was": "completing" }),
                    CancelOutcome::AlreadyFinished(status) => {
                        json!({ "cancelled": false, "was": status })
                    }
                };
                Ok(ApiResponse::ok(body))
            }

            (Post, ["consent"]) => {
                let consent: ConsentRequest = parse_body(&request.body)?;
                let record = self.gate.record_consent(
                    consent.account_id,
                    consent.consent_type,
                    consent.granted,
                    consent.details,
                );
                Ok(ApiResponse::created(to_json(record)?))
            }
            (Get, ["consent", account, consent_type]) => {
                let has_consent = self
                    .gate
                    .has_consent(&AccountId::new(*account), consent_type);
                Ok(ApiResponse::ok(json!({ "has_consent": has_consent })))
            }

            (Post, ["entities"]) => {
                let account = require_account(request)?;
                let body: CreateEntityRequest = parse_body(&request.body)?;
                let entity_id = self
                    .world
                    .create_entity(account, &body.entity_type, RegionId::new(body.region))
                    .await?;
                Ok(ApiResponse::created(json!({ "entity_id": entity_id })))
            }
            (Get, ["entities"]) => {
                let ids = self.query_entities(&request.query).await?;
                Ok(ApiResponse::ok(to_json(ids)?))
            }
            (Get, ["entities", id]) => {
                let state = self.world.entity_state(parse_id::<EntityId>("entity", id)?).await?;
                Ok(ApiResponse::ok(to_json(state)?))
            }
            (Patch, ["entities", id]) => {
                let account = require_account(request)?;
                let body: SetActiveRequest = parse_body(&request.body)?;
                let entity_id = parse_id::<EntityId>("entity", id)?;
                self.world.set_active(account, entity_id, body.active).await?;
                Ok(ApiResponse::ok(json!({ "active": body.active })))
            }
            (Delete, ["entities", id]) => {
                let account = require_account(request)?;
                let removed = self
                    .world
                    .destroy_entity(account, parse_id::<EntityId>("entity", id)?)
                    .await?;
                Ok(ApiResponse::ok(to_json(removed)?))
            }
            (method, ["entities", id, "components", component_type]) => {
                let entity_id = parse_id::<EntityId>("entity", id)?;
                let component_type = ComponentType::new(*component_type);
                let component = match method {
                    Get => self.world.get_component(entity_id, &component_type).await?,
                    Post => {
                        let account = require_account(request)?;
                        self.world
                            .add_component(account, entity_id, component_type, request.body.clone())
                            .await?
                    }
                    Patch => {
                        let account = require_account(request)?;
                        self.world
                            .update_component(account, entity_id, &component_type, request.body.clone())
                            .await?
                    }
                    Delete => {
                        let account = require_account(request)?;
                        self.world
                            .remove_component(account, entity_id, &component_type)
                            .await?
                    }
                };
                let status = if method == Post { 201 } else { 200 };
                Ok(ApiResponse {
                    status,
                    body: to_json(component)?,
                })
            }
            (Get, ["world", region, "state"]) => {
                let snapshot = self.world.region_state(&RegionId::new(*region)).await;
                Ok(ApiResponse::ok(to_json(snapshot)?))
            }

            (method, _) => Err(ApiError::not_found(format!(
                "no route for {method} {}",
                request.path
            ))),
        }
    }

    /// `GET /entities?component=a,b` (AND), `?type=`, or `?region=`.
    async fn query_entities(&self, query: &HashMap<String, String>) -> ApiResult<Vec<EntityId>> {
        if let Some(components) = query.get("component") {
            let types: Vec<ComponentType> = components
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ComponentType::new)
                .collect();
            return Ok(match types.as_slice() {
                [single] => self.world.entities_with_component(single).await,
                _ => self.world.entities_with_components(&types).await,
            });
        }
        if let Some(entity_type) = query.get("type") {
            return Ok(self.world.entities_by_type(entity_type).await);
        }
        if let Some(region) = query.get("region") {
            return Ok(self.world.entities_by_region(&RegionId::new(region.clone())).await);
        }
        Err(ApiError::bad_request(
            "entity queries need one of: component, type, region",
        ))
    }
}

impl From<crate::orchestrator::Job> for JobView {
    fn from(job: crate::orchestrator::Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result,
            error: job.error,
            retry_count: job.retry_count,
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Value) -> ApiResult<T> {
    serde_json::from_value(body.clone()).map_err(|e| ApiError::bad_request(e.to_string()))
}

/// Unparseable IDs cannot name anything, so they are reported as unknown.
fn parse_id<T: FromStr>(kind: &str, raw: &str) -> ApiResult<T> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("{kind} not found: {raw}")))
}

fn require_account(request: &ApiRequest) -> ApiResult<&AccountId> {
    request
        .account
        .as_ref()
        .ok_or_else(|| ApiError::bad_request("request needs an account"))
}

fn to_json<T: Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::new(500, e.to_string()))
}
