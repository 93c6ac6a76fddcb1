//! REST surface: public control endpoints plus the bearer-gated internal
//! endpoints the scheduler and controller identities call.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api::models::*;
use crate::api::sse;
use crate::domain::instance::{InstanceId, InstanceState};
use crate::domain::worker::{Capacity, WorkerId};
use crate::error::ControlError;
use crate::fanout::EventFanout;
use crate::service::{CreateInstanceParams, StateService};
use crate::store::docs::DefinitionFilter;
use crate::telemetry::Metrics;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub service: Arc<StateService>,
    pub fanout: Arc<EventFanout>,
    pub metrics: Metrics,
    pub internal_token: String,
}

/// Map a control-plane error onto the HTTP contract: conflict maps to 409,
/// invalid transition to 422, capacity exhaustion to 202 with a pending
/// body, contract and configuration failures to 500/503 with an audit id.
pub fn into_response(err: ControlError) -> Response {
    let audit_id = Uuid::new_v4();
    match &err {
        ControlError::Conflict { .. } | ControlError::PortAllocationConflict { .. } => (
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: err.to_string(),
                audit_id,
            }),
        )
            .into_response(),
        ControlError::InvalidTransition { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody {
                error: err.to_string(),
                audit_id,
            }),
        )
            .into_response(),
        ControlError::CapacityExhausted(detail) => (
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                status: "pending",
                detail: detail.clone(),
            }),
        )
            .into_response(),
        ControlError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: err.to_string(),
                audit_id,
            }),
        )
            .into_response(),
        ControlError::ContractViolation(_) | ControlError::Internal(_) => {
            tracing::error!(%audit_id, error = %err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: err.to_string(),
                    audit_id,
                }),
            )
                .into_response()
        }
        ControlError::Config(_)
        | ControlError::Storage(_)
        | ControlError::Transient(_)
        | ControlError::LeaseLost(_) => {
            tracing::error!(%audit_id, error = %err, "request failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: err.to_string(),
                    audit_id,
                }),
            )
                .into_response()
        }
    }
}

/// Build the full router.
pub fn router(ctx: ApiContext) -> Router {
    let internal = Router::new()
        .route("/instances/{id}/schedule", post(schedule_instance))
        .route("/instances/{id}/transition", post(transition_instance))
        .route("/workers/{id}/transition", post(transition_worker))
        .route("/workers/{id}/ports/allocate", post(allocate_ports))
        .route("/workers/scale-up", post(scale_up))
        .route("/workers/{id}/scale-down", post(scale_down))
        .route("/workers/import", post(import_worker))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            require_internal_identity,
        ));

    Router::new()
        .route("/v1/definitions", post(create_definition).get(list_definitions))
        .route(
            "/v1/definitions/{name}/{version}",
            get(get_definition).delete(deprecate_definition),
        )
        .route("/v1/definitions/{name}/{version}/sync", post(sync_definition))
        .route("/v1/instances", post(create_instance).get(list_instances))
        .route("/v1/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/v1/instances/{id}/start", post(start_instance))
        .route("/v1/instances/{id}/stop", post(stop_instance))
        .route("/v1/instances/{id}/collect", post(collect_instance))
        .route("/v1/workers", get(list_workers))
        .route("/v1/workers/{id}", get(get_worker))
        .route("/v1/workers/{id}/ports", get(worker_ports))
        .route("/v1/capacity", get(capacity))
        .route("/v1/events/stream", get(sse::stream))
        .route("/v1/events/assessment", post(sse::assessment))
        .route("/metrics", get(metrics))
        .nest("/internal", internal)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Internal endpoints accept only the scheduler/controller identity.
async fn require_internal_identity(
    State(ctx): State<ApiContext>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == ctx.internal_token)
        .unwrap_or(false);
    if !authorized {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

// ----------------------------------------------------------------------
// Definitions
// ----------------------------------------------------------------------

async fn create_definition(
    State(ctx): State<ApiContext>,
    Json(request): Json<CreateDefinitionRequest>,
) -> Response {
    let definition = request.into_definition();
    match ctx.service.create_definition(definition.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(definition)).into_response(),
        Err(err) => into_response(err),
    }
}

async fn list_definitions(
    State(ctx): State<ApiContext>,
    Query(query): Query<ListDefinitionsQuery>,
) -> Response {
    let filter = DefinitionFilter {
        name: query.name,
        owner: query.owner,
        include_deprecated: query.include_deprecated,
    };
    match ctx.service.list_definitions(&filter) {
        Ok(definitions) => Json(definitions).into_response(),
        Err(err) => into_response(err),
    }
}

async fn get_definition(
    State(ctx): State<ApiContext>,
    Path((name, version)): Path<(String, String)>,
) -> Response {
    let reference = crate::domain::definition::DefinitionRef { name, version };
    match ctx.service.definition(&reference) {
        Ok(definition) => Json(definition).into_response(),
        Err(err) => into_response(err),
    }
}

async fn sync_definition(
    State(ctx): State<ApiContext>,
    Path((name, version)): Path<(String, String)>,
    Json(request): Json<SyncDefinitionRequest>,
) -> Response {
    match ctx
        .service
        .sync_definition(&name, &version, request.artifact_content)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => into_response(err),
    }
}

async fn deprecate_definition(
    State(ctx): State<ApiContext>,
    Path((name, version)): Path<(String, String)>,
) -> Response {
    match ctx.service.deprecate_definition(&name, &version).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => into_response(err),
    }
}

// ----------------------------------------------------------------------
// Instances
// ----------------------------------------------------------------------

async fn create_instance(
    State(ctx): State<ApiContext>,
    Json(request): Json<CreateInstanceRequest>,
) -> Response {
    let params = CreateInstanceParams {
        definition: request.definition,
        timeslot: request.timeslot,
        owner: request.owner,
        reservation_ref: request.reservation_ref,
    };
    match ctx.service.create_instance(params).await {
        Ok(instance) => (StatusCode::CREATED, Json(instance)).into_response(),
        Err(err) => into_response(err),
    }
}

async fn list_instances(State(ctx): State<ApiContext>) -> Response {
    match ctx.service.list_instances().await {
        Ok(instances) => {
            let bodies: Vec<_> = instances.into_iter().map(|(i, _)| i).collect();
            Json(bodies).into_response()
        }
        Err(err) => into_response(err),
    }
}

async fn get_instance(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    let id = match InstanceId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx.service.get_instance(id).await {
        Ok(Some((instance, _))) => Json(instance).into_response(),
        Ok(None) => into_response(ControlError::NotFound {
            kind: "instance",
            id: id.to_string(),
        }),
        Err(err) => into_response(err),
    }
}

async fn start_instance(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    transition_by_api(ctx, &id, InstanceState::Instantiating).await
}

async fn stop_instance(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    transition_by_api(ctx, &id, InstanceState::Stopping).await
}

async fn collect_instance(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    transition_by_api(ctx, &id, InstanceState::Collecting).await
}

async fn transition_by_api(ctx: ApiContext, raw_id: &str, target: InstanceState) -> Response {
    let id = match InstanceId::parse_str(raw_id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .transition_instance(id, target, crate::domain::event::Component::Api)
        .await
    {
        Ok(instance) => Json(instance).into_response(),
        Err(err) => into_response(err),
    }
}

/// Cancel an instance. A pending instance is removed outright; a scheduled
/// one is unwound to pending first; an active one is sent through the
/// stopping path and reported as accepted.
async fn delete_instance(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    let id = match InstanceId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    let Ok(found) = ctx.service.get_instance(id).await else {
        return into_response(ControlError::Transient("instance read failed".to_string()));
    };
    let Some((instance, revision)) = found else {
        return into_response(ControlError::NotFound {
            kind: "instance",
            id: id.to_string(),
        });
    };
    let result = match instance.state {
        InstanceState::Pending => ctx.service.destroy_instance(id, revision).await,
        InstanceState::Scheduled => {
            match ctx
                .service
                .transition_instance(id, InstanceState::Pending, crate::domain::event::Component::Api)
                .await
            {
                Ok(_) => match ctx.service.get_instance(id).await {
                    Ok(Some((_, revision))) => ctx.service.destroy_instance(id, revision).await,
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            }
        }
        state if state.is_active() => {
            return match ctx
                .service
                .transition_instance(id, InstanceState::Stopping, crate::domain::event::Component::Api)
                .await
            {
                Ok(_) => StatusCode::ACCEPTED.into_response(),
                Err(err) => into_response(err),
            };
        }
        _ => return StatusCode::ACCEPTED.into_response(),
    };
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => into_response(err),
    }
}

// ----------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------

async fn list_workers(State(ctx): State<ApiContext>) -> Response {
    match ctx.service.list_workers().await {
        Ok(workers) => {
            let bodies: Vec<_> = workers.into_iter().map(|(w, _)| w).collect();
            Json(bodies).into_response()
        }
        Err(err) => into_response(err),
    }
}

async fn get_worker(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    let id = match WorkerId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx.service.get_worker(id).await {
        Ok(Some((worker, _))) => Json(worker).into_response(),
        Ok(None) => into_response(ControlError::NotFound {
            kind: "worker",
            id: id.to_string(),
        }),
        Err(err) => into_response(err),
    }
}

async fn worker_ports(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    let id = match WorkerId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx.service.get_worker(id).await {
        Ok(Some((worker, _))) => Json(worker.port_allocations).into_response(),
        Ok(None) => into_response(ControlError::NotFound {
            kind: "worker",
            id: id.to_string(),
        }),
        Err(err) => into_response(err),
    }
}

async fn capacity(State(ctx): State<ApiContext>) -> Response {
    match ctx.service.list_workers().await {
        Ok(workers) => {
            let entries: Vec<WorkerCapacity> =
                workers.iter().map(|(w, _)| WorkerCapacity::from(w)).collect();
            let total_declared = workers
                .iter()
                .fold(Capacity::default(), |acc, (w, _)| acc.plus(&w.declared));
            let total_allocated = workers
                .iter()
                .fold(Capacity::default(), |acc, (w, _)| acc.plus(&w.allocated));
            Json(CapacityResponse {
                workers: entries,
                total_declared,
                total_allocated,
            })
            .into_response()
        }
        Err(err) => into_response(err),
    }
}

async fn metrics(State(ctx): State<ApiContext>) -> Response {
    match ctx.metrics.render() {
        Ok(text) => text.into_response(),
        Err(err) => into_response(err),
    }
}

// ----------------------------------------------------------------------
// Internal endpoints
// ----------------------------------------------------------------------

async fn schedule_instance(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    let id = match InstanceId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    let (instance, revision) = match ctx.service.get_instance(id).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            return into_response(ControlError::NotFound {
                kind: "instance",
                id: id.to_string(),
            })
        }
        Err(err) => return into_response(err),
    };
    let definition = match ctx.service.definition(&instance.definition) {
        Ok(definition) => definition,
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .commit_placement(&instance, revision, request.worker_id, &definition)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => into_response(err),
    }
}

async fn transition_instance(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(request): Json<InstanceTransitionRequest>,
) -> Response {
    let id = match InstanceId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .transition_instance(id, request.target, crate::domain::event::Component::Controller)
        .await
    {
        Ok(instance) => Json(instance).into_response(),
        Err(err) => into_response(err),
    }
}

async fn transition_worker(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(request): Json<WorkerTransitionRequest>,
) -> Response {
    let id = match WorkerId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .transition_worker(
            id,
            request.target,
            request.drain_deadline,
            crate::domain::event::Component::Controller,
        )
        .await
    {
        Ok(worker) => Json(worker).into_response(),
        Err(err) => into_response(err),
    }
}

async fn allocate_ports(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(request): Json<AllocatePortsRequest>,
) -> Response {
    let worker_id = match WorkerId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    let instance = match ctx.service.get_instance(request.instance_id).await {
        Ok(Some((instance, _))) => instance,
        Ok(None) => {
            return into_response(ControlError::NotFound {
                kind: "instance",
                id: request.instance_id.to_string(),
            })
        }
        Err(err) => return into_response(err),
    };
    let definition = match ctx.service.definition(&instance.definition) {
        Ok(definition) => definition,
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .ports()
        .allocate(worker_id, instance.id, &definition.port_template)
        .await
    {
        Ok(ports) => Json(ports).into_response(),
        Err(err) => into_response(err),
    }
}

/// Record a scale-up request; the controller owns the cloud call.
async fn scale_up(State(ctx): State<ApiContext>, Json(request): Json<ScaleUpRequest>) -> Response {
    ctx.service
        .emit(crate::domain::event::EventEnvelope::scale_up_requested(
            &request.template,
            request.instance_id,
            &request.reason,
            crate::domain::event::Component::Api,
        ))
        .await;
    StatusCode::ACCEPTED.into_response()
}

/// Begin draining a worker out of the fleet, honoring its template's drain
/// timeout.
async fn scale_down(State(ctx): State<ApiContext>, Path(id): Path<String>) -> Response {
    let id = match WorkerId::parse_str(&id) {
        Ok(id) => id,
        Err(err) => return into_response(err),
    };
    let template_name = match ctx.service.get_worker(id).await {
        Ok(Some((worker, _))) => worker.template,
        Ok(None) => {
            return into_response(ControlError::NotFound {
                kind: "worker",
                id: id.to_string(),
            })
        }
        Err(err) => return into_response(err),
    };
    let drain_secs = ctx
        .service
        .docs()
        .get_template(&template_name)
        .ok()
        .flatten()
        .and_then(|t| t.drain_timeout_secs)
        .unwrap_or(4 * 3600);
    let deadline = chrono::Utc::now() + chrono::Duration::seconds(drain_secs as i64);
    match ctx
        .service
        .transition_worker(
            id,
            crate::domain::worker::WorkerState::Draining,
            Some(deadline),
            crate::domain::event::Component::Api,
        )
        .await
    {
        Ok(worker) => Json(worker).into_response(),
        Err(err) => into_response(err),
    }
}

async fn import_worker(
    State(ctx): State<ApiContext>,
    Json(request): Json<ImportWorkerRequest>,
) -> Response {
    let template = match ctx.service.docs().get_template(&request.template) {
        Ok(Some(template)) => template,
        Ok(None) => {
            return into_response(ControlError::Config(format!(
                "worker template {} is not seeded",
                request.template
            )))
        }
        Err(err) => return into_response(err),
    };
    match ctx
        .service
        .import_worker(&template, request.name, request.cloud_instance_id)
        .await
    {
        Ok(worker) => (StatusCode::CREATED, Json(worker)).into_response(),
        Err(err) => into_response(err),
    }
}
