//! HTTP handlers for the oracle's REST surface.

use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use synapse_core::ingest::{freshness_ok, unix_now};
use synapse_core::replay::EndpointFamily;
use synapse_core::scoring;
use synapse_core::sigs;
use synapse_core::{IngestError, TelemetryReport};
use synapse_pipeline::TopologyEvent;
use synapse_storage::models::{agent_status, node_mode, AssignmentRow, NodeRow};
use tracing::warn;

use crate::payloads::{NodeRegisterPayload, PipelineReadyPayload, PipelineRegisterPayload};

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// Wraps JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, [("Access-Control-Allow-Origin", "*")], Json(body)).into_response()
}

fn sanitize_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 200)
}

fn internal<E: std::fmt::Display>(e: E) -> Response {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiResponse::<()>::error(e.to_string()),
    )
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub model: Option<String>,
}

// ======== Telemetry ========

/// `POST /api/metrics` and `POST /api/v1/metrics/report`
pub async fn submit_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<TelemetryReport>,
) -> Response {
    let presented_key = headers
        .get("x-oracle-key")
        .and_then(|v| v.to_str().ok());

    match state.ingestor.handle_report(&report, presented_key).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "success": true,
                "shouldReset": outcome.should_reset,
            }),
        ),
        Err(e) => {
            let status = match &e {
                IngestError::Signature(_) | IngestError::StaleOrReplay(_) => {
                    StatusCode::UNAUTHORIZED
                }
                IngestError::Bounds(_) | IngestError::Unregistered(_) => StatusCode::BAD_REQUEST,
                IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            json_response(
                status,
                serde_json::json!({
                    "success": false,
                    "error": e.code(),
                    "message": e.to_string(),
                }),
            )
        }
    }
}

// ======== Signed node / pipeline lifecycle ========

/// Shared auth for the signed lifecycle endpoints: signature, freshness
/// window, monotonic replay cursor.
fn check_signed(
    state: &AppState,
    family: EndpointFamily,
    address: &str,
    message: &str,
    signature: &str,
    timestamp: i64,
) -> Result<(), Response> {
    if let Err(reason) = sigs::verify_signed(message, signature, address) {
        return Err(json_response(
            StatusCode::UNAUTHORIZED,
            ApiResponse::<()>::error(format!("rejected-signature: {reason}")),
        ));
    }
    if !freshness_ok(unix_now(), timestamp) {
        return Err(json_response(
            StatusCode::UNAUTHORIZED,
            ApiResponse::<()>::error("rejected-stale-or-replay: outside freshness window"),
        ));
    }
    if !state.replay.is_fresh(family, address, timestamp) {
        return Err(json_response(
            StatusCode::UNAUTHORIZED,
            ApiResponse::<()>::error("rejected-stale-or-replay: replay"),
        ));
    }
    Ok(())
}

/// `POST /api/nodes/register`
pub async fn register_node(
    State(state): State<AppState>,
    Json(payload): Json<NodeRegisterPayload>,
) -> Response {
    let address = payload.address.to_lowercase();
    if let Err(resp) = check_signed(
        &state,
        EndpointFamily::NodeRegister,
        &address,
        &payload.canonical_message(),
        &payload.signature,
        payload.timestamp,
    ) {
        return resp;
    }

    let now = unix_now();
    let node = NodeRow {
        address: address.clone(),
        endpoint: payload.endpoint,
        capabilities: payload.capabilities,
        status: agent_status::ACTIVE.to_string(),
        score: 0.0,
        last_heartbeat: now,
        last_metric_report: 0,
        registration_signature: Some(payload.signature),
        benchmark_tok_per_sec: payload.benchmark_tok_per_sec,
        lan_ip: payload.lan_ip,
        can_distribute: payload.can_distribute,
        updated_at: None,
    };

    if let Err(e) = state.store.upsert_node(&node).await {
        return internal(e);
    }
    state
        .replay
        .advance(EndpointFamily::NodeRegister, &address, payload.timestamp);

    json_response(StatusCode::OK, ApiResponse::ok(serde_json::json!({ "address": address })))
}

/// `POST /api/v1/pipeline/register`
pub async fn register_pipeline(
    State(state): State<AppState>,
    Json(payload): Json<PipelineRegisterPayload>,
) -> Response {
    let address = payload.address.to_lowercase();
    if let Err(resp) = check_signed(
        &state,
        EndpointFamily::PipelineRegister,
        &address,
        &payload.canonical_message(),
        &payload.signature,
        payload.timestamp,
    ) {
        return resp;
    }

    let now = unix_now();
    let joined = match state.store.get_assignment(&address, &payload.model).await {
        Ok(existing) => existing.is_none(),
        Err(e) => return internal(e),
    };

    let row = AssignmentRow {
        node_address: address.clone(),
        model_name: payload.model.clone(),
        layer_start: 0,
        layer_end: 0,
        total_layers: 0,
        grpc_endpoint: payload.grpc_endpoint,
        http_endpoint: payload.http_endpoint,
        ram_mb: payload.ram_mb,
        device: payload.device,
        vram_mb: payload.vram_mb,
        benchmark_tok_per_sec: payload.benchmark_tok_per_sec,
        ready: false,
        pipeline_order: 0,
        node_mode: node_mode::STANDALONE.to_string(),
        cluster_id: None,
        rpc_port: payload.rpc_port,
        lan_ip: payload.lan_ip,
        updated_at: now,
    };

    if let Err(e) = state.store.upsert_assignment(&row).await {
        return internal(e);
    }
    state
        .replay
        .advance(EndpointFamily::PipelineRegister, &address, payload.timestamp);

    if joined {
        state.bus.publish(TopologyEvent::NodeJoined {
            model: payload.model.clone(),
            address: address.clone(),
            timestamp: now,
        });
    }

    // Registration re-runs cluster formation and the layer split
    if let Err(e) = state.clusters.rebalance_model(&payload.model).await {
        warn!(model = %payload.model, "rebalance after registration failed: {e}");
    }

    let assignment = match state.store.get_assignment(&address, &payload.model).await {
        Ok(Some(a)) => a,
        Ok(None) => return internal("assignment vanished after rebalance"),
        Err(e) => return internal(e),
    };

    json_response(StatusCode::OK, ApiResponse::ok(assignment))
}

/// `POST /api/v1/pipeline/ready`
pub async fn pipeline_ready(
    State(state): State<AppState>,
    Json(payload): Json<PipelineReadyPayload>,
) -> Response {
    let address = payload.address.to_lowercase();
    if let Err(resp) = check_signed(
        &state,
        EndpointFamily::PipelineReady,
        &address,
        &payload.canonical_message(),
        &payload.signature,
        payload.timestamp,
    ) {
        return resp;
    }

    match state.store.set_assignment_ready(&address, &payload.model).await {
        Ok(true) => {
            state
                .replay
                .advance(EndpointFamily::PipelineReady, &address, payload.timestamp);
            state.bus.publish(TopologyEvent::NodeStatus {
                model: payload.model.clone(),
                address: address.clone(),
                status: "ready".to_string(),
                timestamp: unix_now(),
            });
            json_response(StatusCode::OK, ApiResponse::ok(serde_json::json!({ "ready": true })))
        }
        Ok(false) => json_response(
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::error("no assignment for this node and model"),
        ),
        Err(e) => internal(e),
    }
}

/// `GET /api/v1/pipeline/topology?model=…`
pub async fn pipeline_topology(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> Response {
    let Some(model) = query.model else {
        return json_response(
            StatusCode::BAD_REQUEST,
            ApiResponse::<()>::error("model query parameter is required"),
        );
    };

    match state.allocator.topology(&model).await {
        Ok(rows) => json_response(
            StatusCode::OK,
            ApiResponse::ok(serde_json::json!({
                "model": model,
                "totalLayers": state.allocator.catalog().layer_count(&model),
                "nodes": rows,
            })),
        ),
        Err(e) => internal(e),
    }
}

// ======== Read API ========

pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.get_network_stats().await {
        Ok(stats) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "epoch": stats.epoch,
                "activeNodes": stats.active_nodes,
            }),
        ),
        Err(e) => internal(e),
    }
}

pub async fn list_nodes(State(state): State<AppState>) -> Response {
    match state.store.list_nodes().await {
        Ok(nodes) => json_response(StatusCode::OK, ApiResponse::ok(nodes)),
        Err(e) => internal(e),
    }
}

pub async fn get_node(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    match state.store.get_node(&address.to_lowercase()).await {
        Ok(Some(node)) => json_response(StatusCode::OK, ApiResponse::ok(node)),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::error("node not found"),
        ),
        Err(e) => internal(e),
    }
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    let limit = sanitize_limit(page.limit);
    let offset = page.offset.unwrap_or(0).max(0);
    match state.store.list_agents(limit, offset).await {
        Ok(agents) => json_response(StatusCode::OK, ApiResponse::ok(agents)),
        Err(e) => internal(e),
    }
}

pub async fn get_agent(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    match state.store.get_agent(&address.to_lowercase()).await {
        Ok(Some(agent)) => json_response(StatusCode::OK, ApiResponse::ok(agent)),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::error("agent not found"),
        ),
        Err(e) => internal(e),
    }
}

pub async fn list_epochs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    match state.store.list_epochs(sanitize_limit(page.limit)).await {
        Ok(epochs) => json_response(StatusCode::OK, ApiResponse::ok(epochs)),
        Err(e) => internal(e),
    }
}

pub async fn get_epoch(State(state): State<AppState>, Path(number): Path<i64>) -> Response {
    match state.store.get_epoch(number).await {
        Ok(Some(epoch)) => json_response(StatusCode::OK, ApiResponse::ok(epoch)),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::error("epoch not found"),
        ),
        Err(e) => internal(e),
    }
}

pub async fn list_challenges(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    match state.store.list_challenges(sanitize_limit(page.limit)).await {
        Ok(challenges) => json_response(StatusCode::OK, ApiResponse::ok(challenges)),
        Err(e) => internal(e),
    }
}

pub async fn get_rewards(State(state): State<AppState>, Path(address): Path<String>) -> Response {
    let address = address.to_lowercase();
    let agent = match synapse_chain::parse_address(&address) {
        Ok(a) => a,
        Err(e) => {
            return json_response(StatusCode::BAD_REQUEST, ApiResponse::<()>::error(e.to_string()))
        }
    };

    let pending = match state.chain.pending_reward(agent).await {
        Ok(p) => p.to_string(),
        Err(e) => {
            warn!(address = %address, "pending reward read failed: {e}");
            "0".to_string()
        }
    };

    match state.store.contributions_for_address(&address).await {
        Ok(contributions) => json_response(
            StatusCode::OK,
            ApiResponse::ok(serde_json::json!({
                "address": address,
                "pendingReward": pending,
                "contributions": contributions,
            })),
        ),
        Err(e) => internal(e),
    }
}

/// `GET /api/formula` — the live score weights, straight from the scorer
pub async fn get_formula() -> Response {
    json_response(StatusCode::OK, ApiResponse::ok(scoring::formula()))
}

pub async fn get_stats(State(state): State<AppState>) -> Response {
    match state.store.get_network_stats().await {
        Ok(stats) => json_response(StatusCode::OK, ApiResponse::ok(stats)),
        Err(e) => internal(e),
    }
}

pub async fn leaderboard(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Response {
    let epoch = match state.chain.current_epoch().await {
        Ok(e) => e as i64,
        Err(e) => return internal(e),
    };
    match state
        .store
        .leaderboard(epoch, sanitize_limit(page.limit))
        .await
    {
        Ok(rows) => json_response(
            StatusCode::OK,
            ApiResponse::ok(serde_json::json!({ "epoch": epoch, "leaders": rows })),
        ),
        Err(e) => internal(e),
    }
}

pub async fn metrics_for_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Response {
    match state.store.metrics_for_address(&address.to_lowercase()).await {
        Ok(rows) => json_response(StatusCode::OK, ApiResponse::ok(rows)),
        Err(e) => internal(e),
    }
}

pub async fn proofs_for_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(page): Query<PageQuery>,
) -> Response {
    match state
        .store
        .list_proofs(&address.to_lowercase(), sanitize_limit(page.limit))
        .await
    {
        Ok(rows) => json_response(StatusCode::OK, ApiResponse::ok(rows)),
        Err(e) => internal(e),
    }
}

pub async fn proof_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Response {
    match state.store.proof_stats(&address.to_lowercase()).await {
        Ok((total, verified, total_tokens, verified_tokens)) => json_response(
            StatusCode::OK,
            ApiResponse::ok(serde_json::json!({
                "total": total,
                "verified": verified,
                "totalTokens": total_tokens,
                "verifiedTokens": verified_tokens,
            })),
        ),
        Err(e) => internal(e),
    }
}
