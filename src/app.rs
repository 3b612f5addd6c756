//! Application wiring and lifecycle.
//!
//! A single `App` value owns every component; there is no module-scope
//! mutable state. Components form a DAG — the HTTP server first, then ping
//! and membership, then the engines, then the proxy — and each must report
//! healthy before its dependents start. The first component to fail stops
//! the rest and is reported by name; graceful shutdown awaits every
//! component within a bounded window.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::alloc::AllocService;
use crate::client::RaftJoinClient;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::discovery::Discoverer;
use crate::error::ConfigError;
use crate::gossip::{EventHandler, MemberlistService};
use crate::handlers::HttpState;
use crate::instance::Instance;
use crate::metrics::register_metrics;
use crate::ping::PingService;
use crate::proxy::ProxyService;
use crate::rate::RateService;
use crate::server::run_http_server;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("module {module} failed: {reason}")]
    ModuleFailed { module: &'static str, reason: String },
}

/// Logs membership transitions as gossip observes them.
struct MembershipLogger;

impl EventHandler for MembershipLogger {
    fn on_join(&self, instance: &Instance) {
        info!(
            service = %instance.service,
            host = %instance.host,
            http_port = instance.http_port,
            "member joined"
        );
    }

    fn on_leave(&self, instance: &Instance) {
        info!(
            service = %instance.service,
            host = %instance.host,
            http_port = instance.http_port,
            "member left"
        );
    }

    fn on_update(&self, instance: &Instance) {
        info!(
            service = %instance.service,
            host = %instance.host,
            http_port = instance.http_port,
            "member updated"
        );
    }
}

pub struct App {
    cfg: Config,
}

impl App {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Starts every component for the configured target, serves until
    /// `shutdown` resolves (or a component fails), then stops everything.
    pub async fn run(
        &self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), AppError> {
        if let Err(e) = register_metrics() {
            // Benign on restart-in-process (tests); the metrics exist.
            warn!(error = %e, "metrics already registered");
        }

        let target = self.cfg.target;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let discoverer = Arc::new(Discoverer::new()?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = watch::channel(false);

        // ── Build components (engines before the server exposes them) ─────

        let rate = if target.runs_rate() {
            Some(Arc::new(RateService::new(&self.cfg.rate, clock.clone())?))
        } else {
            None
        };

        let raft_addr = format!(
            "{}:{}",
            advertise_host(&self.cfg),
            self.cfg.server.http_port
        );
        let alloc = if target.runs_alloc() {
            Some(Arc::new(
                AllocService::new(self.cfg.alloc.clone(), raft_addr).await?,
            ))
        } else {
            None
        };

        let proxy = if target.runs_proxy() {
            Some(Arc::new(ProxyService::new(
                self.cfg.proxy.clone(),
                Arc::clone(&discoverer),
            )))
        } else {
            None
        };

        // ── Core: server, then ping + membership ──────────────────────────

        let memberlist = MemberlistService::new(
            self.cfg.memberlist.clone(),
            &discoverer,
            target.as_str(),
            self.cfg.server.http_port,
            vec![Arc::new(MembershipLogger)],
        )
        .await?;

        let state = Arc::new(HttpState {
            ping: PingService,
            memberlist: Some(Arc::clone(&memberlist)),
            rate: rate.clone(),
            alloc: alloc.clone(),
            proxy: proxy.clone(),
            ready: ready_rx,
        });

        let mut modules: JoinSet<&'static str> = JoinSet::new();

        {
            let state = Arc::clone(&state);
            let shutdown_rx = shutdown_rx.clone();
            let http_port = self.cfg.server.http_port;
            modules.spawn(async move {
                run_http_server(http_port, state, shutdown_rx).await;
                "server"
            });
        }

        self.await_server_healthy().await?;
        info!(module = "server", "module healthy");

        // ── Engines ───────────────────────────────────────────────────────

        if let Some(alloc) = &alloc {
            let join_client = RaftJoinClient::new();
            alloc
                .start(&memberlist, &join_client)
                .await
                .map_err(|e| AppError::ModuleFailed {
                    module: "alloc",
                    reason: e.to_string(),
                })?;
            info!(module = "alloc", "module healthy");
        }

        if rate.is_some() {
            info!(module = "rate", "module healthy");
        }

        // ── Proxy ─────────────────────────────────────────────────────────

        if let Some(proxy) = &proxy {
            let proxy = Arc::clone(proxy);
            let shutdown_rx = shutdown_rx.clone();
            modules.spawn(async move {
                proxy.run(shutdown_rx).await;
                "proxy"
            });
            info!(module = "proxy", "module healthy");
        }

        let _ = ready_tx.send(true);
        info!(target = %target, "starting app");

        // ── Serve until shutdown or the first module failure ──────────────

        let failed_module = tokio::select! {
            _ = shutdown => None,
            joined = modules.join_next() => match joined {
                Some(Ok(module)) => Some(module),
                Some(Err(e)) => {
                    error!(error = %e, "module panicked");
                    Some("unknown")
                }
                None => None,
            },
        };

        if let Some(module) = failed_module {
            error!(module = module, "module failed");
        }

        // ── Graceful shutdown, bounded ────────────────────────────────────

        info!("stopping app");
        let _ = shutdown_tx.send(true);

        memberlist.leave().await;
        if let Some(alloc) = &alloc {
            alloc.shutdown().await;
        }

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(joined) = modules.join_next().await {
                if let Ok(module) = joined {
                    info!(module = module, "module terminated");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown timed out; aborting remaining modules");
            modules.abort_all();
        }

        match failed_module {
            Some(module) => Err(AppError::ModuleFailed {
                module,
                reason: "exited before shutdown".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Probes the local HTTP surface until it answers, bounding startup.
    async fn await_server_healthy(&self) -> Result<(), AppError> {
        let url = format!(
            "http://127.0.0.1:{}/api/v1/ping",
            self.cfg.server.http_port
        );
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + STARTUP_PROBE_TIMEOUT;

        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => {
                    return Err(AppError::ModuleFailed {
                        module: "server",
                        reason: "did not become healthy before the startup deadline".to_string(),
                    });
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }
}

/// The address peers should use to reach this node. Prefers the configured
/// gossip host when it is routable, then the machine hostname.
fn advertise_host(cfg: &Config) -> String {
    if cfg.memberlist.gossip_host != "0.0.0.0" {
        return cfg.memberlist.gossip_host.clone();
    }

    std::env::var("HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn advertise_host_prefers_the_configured_gossip_host() {
        let mut cfg = Config::parse("target: all\n").unwrap();
        cfg.memberlist.gossip_host = "10.1.2.3".to_string();
        assert_eq!(advertise_host(&cfg), "10.1.2.3");
    }
}
