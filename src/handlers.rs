//! HTTP endpoint handlers.
//!
//! Handlers decode JSON bodies (400 on malformed input), call the engines,
//! and encode the `{status, msg, result}` envelope. Domain outcomes (not
//! found, invalid version) are envelope statuses with HTTP 200; transport
//! and internal failures surface as plain-text 500s; unknown routes 404.

use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::alloc::AllocService;
use crate::dto::{
    envelope_status, AllocRequestBody, AllocResponseBody, AllowRequestBody, AllowResponseBody,
    ExitRequestBody, FreeRequestBody, FreeResponseBody, JoinRequestBody, JoinResponseBody,
    MemberlistResponseBody, PingResponseBody, ResponseBody, ViewRequestBody, ViewResponseBody,
    STATUS_INTERNAL_ERROR,
};
use crate::error::{ClientError, StorageError};
use crate::gossip::MemberlistService;
use crate::metrics::gather_metrics_string;
use crate::ping::PingService;
use crate::proxy::ProxyService;
use crate::raft::TypeConfig;
use crate::raft_network::{APPEND_ENTRIES_RPC, INSTALL_SNAPSHOT_RPC, VOTE_RPC};
use crate::rate::RateService;

/// Everything the HTTP surface can reach. Components a target does not run
/// stay `None` and their routes answer 404.
pub struct HttpState {
    pub ping: PingService,
    pub memberlist: Option<Arc<MemberlistService>>,
    pub rate: Option<Arc<RateService>>,
    pub alloc: Option<Arc<AllocService>>,
    pub proxy: Option<Arc<ProxyService>>,
    pub ready: watch::Receiver<bool>,
}

pub async fn route(req: Request<Body>, state: Arc<HttpState>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/api/v1/ping") => ping(&state),
        (Method::GET, "/api/v1/memberlist") => memberlist(&state).await,
        (Method::GET, "/api/v1/ready") => ready(&state),
        (Method::GET, "/metrics") => metrics(),

        (Method::POST, "/api/v1/allow") => proxy_allow(req, &state).await,
        (Method::POST, "/api/v1/view") => proxy_view(req, &state).await,
        (Method::POST, "/api/v1/alloc") => proxy_alloc(req, &state).await,
        (Method::POST, "/api/v1/free") => proxy_free(req, &state).await,

        (Method::POST, "/api/v1/internal/allow") => internal_allow(req, &state).await,
        (Method::POST, "/api/v1/internal/view") => internal_view(req, &state).await,
        (Method::POST, "/api/v1/internal/alloc") => internal_alloc(req, &state).await,
        (Method::POST, "/api/v1/internal/free") => internal_free(req, &state).await,

        (Method::POST, "/api/v1/internal/raft/join") => raft_join(req, &state).await,
        (Method::POST, "/api/v1/internal/raft/exit") => raft_exit(req, &state).await,

        (Method::POST, p) if p.starts_with("/api/v1/internal/raft/") => {
            raft_rpc(req, &state, p.to_string()).await
        }

        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

// ── Core endpoints ────────────────────────────────────────────────────────────

fn ping(state: &HttpState) -> Response<Body> {
    envelope_ok(PingResponseBody {
        msg: state.ping.ping().to_string(),
    })
}

async fn memberlist(state: &HttpState) -> Response<Body> {
    let Some(memberlist) = &state.memberlist else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };

    envelope_ok(MemberlistResponseBody {
        members: memberlist.members().await,
    })
}

fn ready(state: &HttpState) -> Response<Body> {
    if *state.ready.borrow() {
        envelope_ok("ready".to_string())
    } else {
        json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ResponseBody::<String>::error(STATUS_INTERNAL_ERROR, "not ready"),
        )
    }
}

fn metrics() -> Response<Body> {
    let body = gather_metrics_string(prometheus::default_registry());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

// ── Proxy tier ────────────────────────────────────────────────────────────────

async fn proxy_allow(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(proxy) = state.proxy.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: AllowRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match proxy
        .allow(&body.namespace, &body.resource, body.tokens)
        .await
    {
        Ok((wait_time, ok)) => envelope_ok(AllowResponseBody {
            wait_time: wait_time.as_nanos() as i64,
            ok,
        }),
        Err(e) => client_error(e),
    }
}

async fn proxy_view(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(proxy) = state.proxy.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: ViewRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match proxy.view(&body.namespace, &body.resource).await {
        Ok((allocated, capacity, version)) => envelope_ok(ViewResponseBody {
            allocated,
            capacity,
            version,
        }),
        Err(e) => client_error(e),
    }
}

async fn proxy_alloc(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(proxy) = state.proxy.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: AllocRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match proxy
        .alloc(&body.namespace, &body.resource, body.tokens, body.version)
        .await
    {
        Ok((remaining_tokens, current_version, ok)) => envelope_ok(AllocResponseBody {
            remaining_tokens,
            current_version,
            ok,
        }),
        Err(e) => client_error(e),
    }
}

async fn proxy_free(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(proxy) = state.proxy.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: FreeRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match proxy
        .free(&body.namespace, &body.resource, body.tokens, body.version)
        .await
    {
        Ok((remaining_tokens, current_version, ok)) => envelope_ok(FreeResponseBody {
            remaining_tokens,
            current_version,
            ok,
        }),
        Err(e) => client_error(e),
    }
}

// ── Engine tier ───────────────────────────────────────────────────────────────

async fn internal_allow(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(rate) = state.rate.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: AllowRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match rate.allow(&body.namespace, &body.resource, body.tokens) {
        Ok((wait_time, ok)) => envelope_ok(AllowResponseBody {
            wait_time: wait_time.as_nanos() as i64,
            ok,
        }),
        Err(e) => storage_error(e),
    }
}

async fn internal_view(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(alloc) = state.alloc.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: ViewRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match alloc.view(&body.namespace, &body.resource).await {
        Ok((allocated, capacity, version)) => envelope_ok(ViewResponseBody {
            allocated,
            capacity,
            version,
        }),
        Err(e) => storage_error(e),
    }
}

async fn internal_alloc(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(alloc) = state.alloc.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: AllocRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match alloc
        .alloc(&body.namespace, &body.resource, body.tokens, body.version)
        .await
    {
        Ok((remaining_tokens, current_version, ok)) => envelope_ok(AllocResponseBody {
            remaining_tokens,
            current_version,
            ok,
        }),
        Err(e) => storage_error(e),
    }
}

async fn internal_free(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(alloc) = state.alloc.clone() else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: FreeRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match alloc
        .free(&body.namespace, &body.resource, body.tokens, body.version)
        .await
    {
        Ok((remaining_tokens, current_version, ok)) => envelope_ok(FreeResponseBody {
            remaining_tokens,
            current_version,
            ok,
        }),
        Err(e) => storage_error(e),
    }
}

// ── Raft membership and RPC fan-in ────────────────────────────────────────────

async fn raft_join(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(storage) = state.alloc.as_ref().and_then(|a| a.raft().cloned()) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: JoinRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match storage.add_replica(body.replica_id, &body.raft_addr).await {
        Ok(already_member) => envelope_ok(JoinResponseBody { already_member }),
        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn raft_exit(req: Request<Body>, state: &HttpState) -> Response<Body> {
    let Some(storage) = state.alloc.as_ref().and_then(|a| a.raft().cloned()) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let body: ExitRequestBody = match decode(req).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    match storage.remove_replica(body.replica_id).await {
        Ok(()) => envelope_ok(serde_json::json!({})),
        Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// `/api/v1/internal/raft/{shard_id}/{rpc}` — feeds a serialized raft RPC
/// to the owning shard and returns the response as JSON. Raft-level errors
/// map to transport-level 500s; the sender retries as unreachable.
async fn raft_rpc(req: Request<Body>, state: &HttpState, path: String) -> Response<Body> {
    let Some(storage) = state.alloc.as_ref().and_then(|a| a.raft().cloned()) else {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "raft back-end not running");
    };

    let suffix = &path["/api/v1/internal/raft/".len()..];
    let Some((shard_str, rpc)) = suffix.split_once('/') else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };
    let Ok(shard_id) = shard_str.parse::<u64>() else {
        return plain(StatusCode::BAD_REQUEST, "invalid shard id");
    };
    let Some(raft) = storage.shard_raft(shard_id) else {
        return plain(StatusCode::NOT_FOUND, "unknown shard");
    };

    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match rpc {
        APPEND_ENTRIES_RPC => {
            let rpc_req: openraft::raft::AppendEntriesRequest<TypeConfig> =
                match serde_json::from_slice(&bytes) {
                    Ok(r) => r,
                    Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
                };
            match raft.append_entries(rpc_req).await {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        VOTE_RPC => {
            let rpc_req: openraft::raft::VoteRequest<u64> = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
            };
            match raft.vote(rpc_req).await {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        INSTALL_SNAPSHOT_RPC => {
            let rpc_req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
                match serde_json::from_slice(&bytes) {
                    Ok(r) => r,
                    Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
                };
            match raft.install_snapshot(rpc_req).await {
                Ok(resp) => json_response(StatusCode::OK, &resp),
                Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn decode<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| plain(StatusCode::BAD_REQUEST, &e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| plain(StatusCode::BAD_REQUEST, &e.to_string()))
}

fn envelope_ok<T: Serialize>(result: T) -> Response<Body> {
    json_response(StatusCode::OK, &ResponseBody::ok(result))
}

fn storage_error(e: StorageError) -> Response<Body> {
    match envelope_status(&e) {
        Some((status, msg)) => {
            json_response(StatusCode::OK, &ResponseBody::<()>::error(status, msg))
        }
        None => {
            warn!(error = %e, "request failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn client_error(e: ClientError) -> Response<Body> {
    match e {
        ClientError::Domain(inner) => storage_error(inner),
        other => {
            warn!(error = %other, "forwarding failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, &other.to_string())
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let encoded = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(encoded))
        .unwrap()
}

fn plain(status: StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(msg.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{
        AllocConfig, AllocQuotaConfig, AllocStrategyConfig, RateConfig, RateQuotaConfig,
        RateStrategyConfig,
    };

    async fn test_state() -> Arc<HttpState> {
        let rate_cfg = RateConfig {
            backend: "memory".to_string(),
            quotas: vec![RateQuotaConfig {
                namespace: "svc".to_string(),
                resource: "req".to_string(),
                strategy: RateStrategyConfig {
                    algorithm: "token-bucket".to_string(),
                    unit: "second".to_string(),
                    requests_per_unit: 100,
                },
            }],
        };
        let alloc_cfg = AllocConfig {
            backend: "memory".to_string(),
            quotas: vec![AllocQuotaConfig {
                namespace: "pool".to_string(),
                resource: "mem".to_string(),
                strategy: AllocStrategyConfig { capacity: 10 },
            }],
            ..Default::default()
        };

        let rate = RateService::new(&rate_cfg, Arc::new(SystemClock::new())).unwrap();
        let alloc = AllocService::new(alloc_cfg, "127.0.0.1:6789".to_string())
            .await
            .unwrap();
        let (_ready_tx, ready_rx) = watch::channel(true);

        Arc::new(HttpState {
            ping: PingService,
            memberlist: None,
            rate: Some(Arc::new(rate)),
            alloc: Some(Arc::new(alloc)),
            proxy: None,
            ready: ready_rx,
        })
    }

    fn post(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_returns_pong_envelope() {
        let state = test_state().await;
        let resp = route(get("/api/v1/ping"), state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], 1001);
        assert_eq!(json["result"]["msg"], "pong");
    }

    #[tokio::test]
    async fn unknown_routes_return_404() {
        let state = test_state().await;
        let resp = route(get("/api/v1/unknown"), state).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_bodies_return_400() {
        let state = test_state().await;
        let resp = route(post("/api/v1/internal/alloc", "{not json"), state).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn internal_allow_decides_through_the_rate_engine() {
        let state = test_state().await;
        let resp = route(
            post(
                "/api/v1/internal/allow",
                r#"{"namespace":"svc","resource":"req","tokens":1}"#,
            ),
            state,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], 1001);
        assert_eq!(json["result"]["ok"], true);
        assert_eq!(json["result"]["wait_time"], 0);
    }

    #[tokio::test]
    async fn internal_alloc_round_trips_the_envelope() {
        let state = test_state().await;

        let resp = route(
            post(
                "/api/v1/internal/alloc",
                r#"{"namespace":"pool","resource":"mem","tokens":3,"version":1}"#,
            ),
            state.clone(),
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], 1001);
        assert_eq!(json["result"]["remaining_tokens"], 7);
        assert_eq!(json["result"]["current_version"], 2);
        assert_eq!(json["result"]["ok"], true);

        // Version mismatch: envelope status 1003 with HTTP 200.
        let resp = route(
            post(
                "/api/v1/internal/alloc",
                r#"{"namespace":"pool","resource":"mem","tokens":1,"version":9}"#,
            ),
            state,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], 1003);
        assert_eq!(json["msg"], "invalid version");
    }

    #[tokio::test]
    async fn unknown_quota_maps_to_envelope_1002() {
        let state = test_state().await;
        let resp = route(
            post(
                "/api/v1/internal/view",
                r#"{"namespace":"nope","resource":"nope"}"#,
            ),
            state,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], 1002);
        assert_eq!(json["msg"], "not found");
    }

    #[tokio::test]
    async fn proxy_routes_404_when_proxy_component_is_absent() {
        let state = test_state().await;
        let resp = route(
            post(
                "/api/v1/allow",
                r#"{"namespace":"svc","resource":"req","tokens":1}"#,
            ),
            state,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn raft_routes_404_without_a_replicated_backend() {
        let state = test_state().await;
        let resp = route(
            post(
                "/api/v1/internal/raft/join",
                r#"{"replica_id":2,"raft_addr":"10.0.0.2:6789"}"#,
            ),
            state,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ready_reflects_the_supervisor_gate() {
        let state = test_state().await;
        let resp = route(get("/api/v1/ready"), state).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let (_tx, ready_rx) = watch::channel(false);
        let not_ready = Arc::new(HttpState {
            ping: PingService,
            memberlist: None,
            rate: None,
            alloc: None,
            proxy: None,
            ready: ready_rx,
        });
        let resp = route(get("/api/v1/ready"), not_ready).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
