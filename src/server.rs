//! HTTP server.
//!
//! One hyper server carries the whole surface: client-facing proxy routes,
//! the internal engine routes, raft RPC fan-in, and the operational
//! endpoints. Every inbound request runs under a 10-second deadline;
//! internal forwards inherit what remains through the clients' own
//! timeouts.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::sync::watch;
use tracing::{error, info};

use crate::handlers::{route, HttpState};
use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

async fn handle(req: Request<Body>, state: Arc<HttpState>) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = match tokio::time::timeout(REQUEST_DEADLINE, route(req, state)).await {
        Ok(response) => response,
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("request deadline exceeded"))
            .unwrap(),
    };

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[path.as_str(), response.status().as_str()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[path.as_str()])
        .observe(started.elapsed().as_secs_f64());

    Ok(response)
}

/// Runs the HTTP server until the shutdown signal fires.
pub async fn run_http_server(
    http_port: u16,
    state: Arc<HttpState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let addr: SocketAddr = ([0, 0, 0, 0], http_port).into();

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, state).await }
            }))
        }
    });

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

    info!(addr = %addr, "http server listening");

    if let Err(e) = server.await {
        error!(error = %e, "http server error");
    }
}
