//! HTTP routes for the broker API.

use crate::state::AppState;
use agentflow_core::bus::{BusEnvelope, TASK_MESSAGE_TYPE};
use agentflow_core::catalog::AgentDefinition;
use agentflow_core::error::BrokerError;
use agentflow_core::task::{AgentTaskRequest, CorrelationId, TaskInstanceId, TaskKind};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;
use warp::{http::StatusCode, Filter, Reply};

/// Create all API routes.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let tasks = warp::path("tasks").and(tasks_routes(state.clone()));
    let events = warp::path!("events" / "agent").and(event_route(state.clone()));
    let catalog = warp::path("catalog")
        .and(warp::path("agents"))
        .and(catalog_routes(state.clone()));
    let flows = warp::path("flows").and(flow_routes(state));

    tasks.or(events).or(catalog).or(flows)
}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_reply(err: &BrokerError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match err {
        BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
        BrokerError::AgentNotFound(_)
        | BrokerError::TaskNotFound(_)
        | BrokerError::BranchNotFound(_)
        | BrokerError::FlowNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::AgentExists(_) | BrokerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BrokerError::Protocol(_) | BrokerError::Transport(_) => StatusCode::BAD_GATEWAY,
        BrokerError::LockContention(_) => StatusCode::SERVICE_UNAVAILABLE,
        BrokerError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            error: err.to_string(),
        }),
        status,
    )
}

fn bad_request(message: String) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse { error: message }),
        StatusCode::BAD_REQUEST,
    )
}

// ============================================================================
// Task routes
// ============================================================================

fn tasks_routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let submit = warp::path::end()
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(submit_task);

    let list = warp::path::end()
        .and(warp::get())
        .and(warp::query::<TasksQuery>())
        .and(with_state(state.clone()))
        .and_then(list_tasks);

    let get = warp::path!(String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_task);

    submit.or(list).or(get)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTaskRequest {
    task_kind: TaskKind,
    #[serde(default)]
    task_input_data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TasksQuery {
    correlation_id: Option<String>,
}

async fn submit_task(
    body: SubmitTaskRequest,
    state: AppState,
) -> Result<impl Reply, Infallible> {
    let task = AgentTaskRequest::root(body.task_kind, body.task_input_data);
    match state.engine.handle(task).await {
        Ok(response) => Ok(warp::reply::with_status(
            warp::reply::json(&response),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// Without a filter this lists root records; with `correlationId` it
/// lists every record of that correlation.
async fn list_tasks(query: TasksQuery, state: AppState) -> Result<impl Reply, Infallible> {
    let records = match query.correlation_id {
        Some(cid) => {
            let Ok(cid) = Uuid::parse_str(&cid) else {
                return Ok(bad_request(format!("'{}' is not a correlation id", cid)));
            };
            state.store.find_by_correlation(CorrelationId(cid)).await
        }
        None => state.store.find_all_roots().await,
    };
    match records {
        Ok(records) => Ok(warp::reply::with_status(
            warp::reply::json(&records),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn get_task(id: String, state: AppState) -> Result<impl Reply, Infallible> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Ok(bad_request(format!("'{}' is not a task instance id", id)));
    };
    let id = TaskInstanceId(id);
    match state.store.find_by_instance_id(id).await {
        Ok(Some(record)) => Ok(warp::reply::with_status(
            warp::reply::json(&record),
            StatusCode::OK,
        )),
        Ok(None) => Ok(error_reply(&BrokerError::TaskNotFound(id))),
        Err(e) => Ok(error_reply(&e)),
    }
}

// ============================================================================
// Bus delivery point
// ============================================================================

fn event_route(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::body::bytes())
        .and(with_state(state))
        .and_then(handle_event)
}

async fn handle_event(
    body: warp::hyper::body::Bytes,
    state: AppState,
) -> Result<impl Reply, Infallible> {
    let envelope = match BusEnvelope::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(error_reply(&e)),
    };
    if envelope.message_type != TASK_MESSAGE_TYPE {
        return Ok(bad_request(format!(
            "unsupported message type '{}'",
            envelope.message_type
        )));
    }
    match state.engine.handle(envelope.payload).await {
        Ok(response) => Ok(warp::reply::with_status(
            warp::reply::json(&response),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

// ============================================================================
// Catalog routes
// ============================================================================

fn catalog_routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let create = warp::path::end()
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(create_agent);

    let upsert = warp::path::end()
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(upsert_agent);

    let list = warp::path::end()
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_agents);

    let get = warp::path!(String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_agent);

    let delete = warp::path!(String)
        .and(warp::delete())
        .and(with_state(state))
        .and_then(delete_agent);

    create.or(upsert).or(list).or(get).or(delete)
}

async fn create_agent(
    agent: AgentDefinition,
    state: AppState,
) -> Result<impl Reply, Infallible> {
    match state.catalog.insert(agent.clone()).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&agent),
            StatusCode::CREATED,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn upsert_agent(
    agent: AgentDefinition,
    state: AppState,
) -> Result<impl Reply, Infallible> {
    match state.catalog.upsert(agent.clone()).await {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&agent),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn list_agents(state: AppState) -> Result<impl Reply, Infallible> {
    match state.catalog.list().await {
        Ok(agents) => Ok(warp::reply::with_status(
            warp::reply::json(&agents),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn get_agent(kind: String, state: AppState) -> Result<impl Reply, Infallible> {
    let kind = TaskKind::new(kind);
    match state.catalog.find_by_task_kind(&kind).await {
        Ok(Some(agent)) => Ok(warp::reply::with_status(
            warp::reply::json(&agent),
            StatusCode::OK,
        )),
        Ok(None) => Ok(error_reply(&BrokerError::AgentNotFound(kind))),
        Err(e) => Ok(error_reply(&e)),
    }
}

async fn delete_agent(kind: String, state: AppState) -> Result<impl Reply, Infallible> {
    let kind = TaskKind::new(kind);
    match state.catalog.remove(&kind).await {
        Ok(true) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({"removed": kind})),
            StatusCode::OK,
        )),
        Ok(false) => Ok(error_reply(&BrokerError::AgentNotFound(kind))),
        Err(e) => Ok(error_reply(&e)),
    }
}

// ============================================================================
// Flow routes
// ============================================================================

fn flow_routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::path!(String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_flow)
}

async fn get_flow(cid: String, state: AppState) -> Result<impl Reply, Infallible> {
    let Ok(cid) = Uuid::parse_str(&cid) else {
        return Ok(bad_request(format!("'{}' is not a correlation id", cid)));
    };
    match state.store.load_flow(CorrelationId(cid)).await {
        Ok(flow) => Ok(warp::reply::with_status(
            warp::reply::json(&flow),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(&e)),
    }
}
