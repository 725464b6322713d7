//! The client-facing HTTP surface of both services.
//!
//! The consensus gateway funnels every operation (reads included) through
//! the leader's log, redirecting clients that hit a follower. The causal
//! gateway answers reads from the local store and turns PATCHes into
//! broadcast EVENTs; any replica serves.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Redirect;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use replikv::causal::Causal;
use replikv::causal::Patch;
use replikv::consensus::Command;
use replikv::consensus::Consensus;
use replikv::error::ClientWriteError;
use replikv::Config;
use replikv::ReplicaId;

/// How long a request that arrived mid-election parks before giving up on
/// a leader emerging.
const LEADER_WAIT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

#[derive(Deserialize)]
struct WriteBody {
    key: String,
    #[serde(default)]
    value: Option<i64>,
}

#[derive(Deserialize)]
struct PatchBody {
    data: Patch,
}

fn service_unavailable(msg: &str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": msg }))).into_response()
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

async fn alive() -> &'static str {
    "I am alive!"
}

///////////////////////////////////////////////////////////////////////////////////////////////////
// Consensus service

#[derive(Clone)]
struct ConsensusGateway {
    engine: Consensus,
    config: Arc<Config>,
}

/// Build the consensus service's router.
pub fn consensus_app(engine: Consensus, config: Arc<Config>) -> Router {
    Router::new()
        .route("/", get(alive))
        .route("/view", get(consensus_view))
        .route(
            "/storage",
            get(consensus_get).post(consensus_post).put(consensus_put).delete(consensus_delete),
        )
        .with_state(ConsensusGateway { engine, config })
}

fn redirect_to_leader(gateway: &ConsensusGateway, leader: ReplicaId, path: &str) -> Response {
    match gateway.config.gateways.get(&leader) {
        Some(addr) => Redirect::temporary(&format!("http://{}{}", addr, path)).into_response(),
        None => service_unavailable("leader gateway unknown"),
    }
}

/// Drive one client operation through the engine.
///
/// A follower answers with a redirect to the leader's gateway. With no
/// leader known (an election is in flight), the request parks until one
/// emerges, then retries; this is the only place a client blocks besides
/// the commit wait inside `client_write`.
async fn submit(gateway: &ConsensusGateway, cmd: Command, path: String) -> Response {
    let is_read = matches!(cmd, Command::Get { .. });
    loop {
        match gateway.engine.client_write(cmd.clone()).await {
            Ok(resp) => {
                let value = if is_read { json!(resp.value) } else { json!("OK") };
                return Json(json!({ "value": value })).into_response();
            }
            Err(ClientWriteError::ForwardToLeader(Some(leader))) => {
                return redirect_to_leader(gateway, leader, &path);
            }
            Err(ClientWriteError::ForwardToLeader(None)) => {
                tracing::debug!("no leader known, parking client request");
                let wait = gateway.engine.wait(Some(LEADER_WAIT));
                if wait.metrics(|m| m.current_leader.is_some(), "leader elected").await.is_err() {
                    return service_unavailable("no leader available");
                }
            }
            Err(ClientWriteError::Engine(err)) => return service_unavailable(&err.to_string()),
        }
    }
}

async fn consensus_view(State(gateway): State<ConsensusGateway>) -> Response {
    match gateway.engine.view().await {
        Ok(view) => Json(view).into_response(),
        Err(err) => service_unavailable(&err.to_string()),
    }
}

async fn consensus_get(State(gateway): State<ConsensusGateway>, Query(query): Query<KeyQuery>) -> Response {
    let path = format!("/storage?key={}", query.key);
    submit(&gateway, Command::Get { key: query.key }, path).await
}

async fn consensus_post(State(gateway): State<ConsensusGateway>, Json(body): Json<WriteBody>) -> Response {
    match body.value {
        Some(value) => submit(&gateway, Command::Post { key: body.key, value }, "/storage".into()).await,
        None => bad_request("value is required"),
    }
}

async fn consensus_put(State(gateway): State<ConsensusGateway>, Json(body): Json<WriteBody>) -> Response {
    match body.value {
        Some(value) => submit(&gateway, Command::Put { key: body.key, value }, "/storage".into()).await,
        None => bad_request("value is required"),
    }
}

async fn consensus_delete(State(gateway): State<ConsensusGateway>, Json(body): Json<WriteBody>) -> Response {
    submit(&gateway, Command::Delete { key: body.key }, "/storage".into()).await
}

///////////////////////////////////////////////////////////////////////////////////////////////////
// Causal service

#[derive(Clone)]
struct CausalGateway {
    engine: Causal,
}

/// Build the causal service's router.
pub fn causal_app(engine: Causal) -> Router {
    Router::new()
        .route("/", get(alive))
        .route("/view", get(causal_view))
        .route("/storage", get(causal_get).patch(causal_patch))
        .with_state(CausalGateway { engine })
}

async fn causal_view(State(gateway): State<CausalGateway>) -> Response {
    match gateway.engine.view().await {
        Ok(view) => Json(view).into_response(),
        Err(err) => service_unavailable(&err.to_string()),
    }
}

async fn causal_get(State(gateway): State<CausalGateway>, Query(query): Query<KeyQuery>) -> Response {
    match gateway.engine.get(query.key).await {
        Ok(value) => Json(json!({ "value": value })).into_response(),
        Err(err) => service_unavailable(&err.to_string()),
    }
}

async fn causal_patch(State(gateway): State<CausalGateway>, Json(body): Json<PatchBody>) -> Response {
    match gateway.engine.patch(body.data).await {
        Ok(id) => {
            tracing::debug!(?id, "patch broadcast");
            Json(json!({ "value": "OK" })).into_response()
        }
        Err(err) => service_unavailable(&err.to_string()),
    }
}
