//! Typed internal HTTP clients.
//!
//! Each call takes an ordered list of candidate addresses. A single address
//! gets up to [`ATTEMPTS_PER_ADDR`] tries under a bounded exponential
//! backoff; connection, transport, and malformed-response failures fall
//! through to the next address. A well-formed domain status (not found,
//! invalid version) is surfaced immediately without further attempts — the
//! back-end answered, it just said no.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::dto::{
    AllocRequestBody, AllocResponseBody, AllowRequestBody, AllowResponseBody, ExitRequestBody,
    FreeRequestBody, FreeResponseBody, JoinRequestBody, JoinResponseBody, MemberlistResponseBody,
    ResponseBody, ViewRequestBody, ViewResponseBody, STATUS_ALLOC_INVALID_VERSION,
    STATUS_ALLOC_NOT_FOUND, STATUS_OK,
};
use crate::error::{ClientError, StorageError};
use crate::gossip::MemberlistService;
use crate::instance::Instance;

const ATTEMPTS_PER_ADDR: u32 = 3;
const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(500);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("reqwest client builds")
}

/// Shared fall-through machinery for the typed clients.
#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
}

impl Transport {
    fn new() -> Self {
        Self {
            http: build_http_client(),
        }
    }

    /// POSTs `body` to `path` on each address in turn.
    async fn post_first<Req, Resp>(
        &self,
        addrs: &[String],
        path: &str,
        body: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if addrs.is_empty() {
            return Err(ClientError::NoAddresses);
        }

        for addr in addrs {
            let url = format!("http://{}{}", addr, path);
            match self.post_with_retry(&url, body).await {
                // A decoded envelope ends the fall-through either way: its
                // domain status (if any) belongs to the caller.
                Ok(envelope) => return unwrap_envelope(envelope),
                Err(e) => {
                    warn!(addr = %addr, path = %path, error = %e, "back-end attempt failed");
                }
            }
        }

        Err(ClientError::AllAttemptsFailed)
    }

    /// One address, up to three tries under exponential backoff.
    async fn post_with_retry<Req, Resp>(
        &self,
        url: &str,
        body: &Req,
    ) -> Result<ResponseBody<Resp>, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut backoff = MIN_RETRY_BACKOFF;

        for attempt in 1..=ATTEMPTS_PER_ADDR {
            match self.post_once(url, body).await {
                Ok(envelope) => return Ok(envelope),
                Err(e) if attempt == ATTEMPTS_PER_ADDR => return Err(e),
                Err(e) => {
                    warn!(url = %url, attempt = attempt, error = %e, "retrying request");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                }
            }
        }

        unreachable!("loop returns on the final attempt")
    }

    async fn post_once<Req, Resp>(
        &self,
        url: &str,
        body: &Req,
    ) -> Result<ResponseBody<Resp>, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "http status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}

/// Resolves a domain envelope into its result, mapping domain statuses back
/// onto the typed storage errors.
fn unwrap_envelope<T>(envelope: ResponseBody<T>) -> Result<T, ClientError> {
    match envelope.status {
        STATUS_OK => envelope
            .result
            .ok_or_else(|| ClientError::Transport("envelope missing result".to_string())),
        STATUS_ALLOC_NOT_FOUND => Err(ClientError::Domain(StorageError::NotFound)),
        STATUS_ALLOC_INVALID_VERSION => Err(ClientError::Domain(StorageError::InvalidVersion)),
        _ => Err(ClientError::Domain(StorageError::from_wire(&envelope.msg))),
    }
}

// ── Rate tier client ──────────────────────────────────────────────────────────

pub struct RateClient {
    transport: Transport,
}

impl RateClient {
    pub fn new() -> Self {
        Self {
            transport: Transport::new(),
        }
    }

    pub async fn allow(
        &self,
        addrs: &[String],
        namespace: &str,
        resource: &str,
        tokens: i64,
    ) -> Result<(Duration, bool), ClientError> {
        let body = AllowRequestBody {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
        };

        let result: AllowResponseBody = self
            .transport
            .post_first(addrs, "/api/v1/internal/allow", &body)
            .await?;

        Ok((Duration::from_nanos(result.wait_time as u64), result.ok))
    }
}

impl Default for RateClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Alloc tier client ─────────────────────────────────────────────────────────

pub struct AllocClient {
    transport: Transport,
}

impl AllocClient {
    pub fn new() -> Self {
        Self {
            transport: Transport::new(),
        }
    }

    pub async fn view(
        &self,
        addrs: &[String],
        namespace: &str,
        resource: &str,
    ) -> Result<(i64, i64, i64), ClientError> {
        let body = ViewRequestBody {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
        };

        let result: ViewResponseBody = self
            .transport
            .post_first(addrs, "/api/v1/internal/view", &body)
            .await?;

        Ok((result.allocated, result.capacity, result.version))
    }

    pub async fn alloc(
        &self,
        addrs: &[String],
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), ClientError> {
        let body = AllocRequestBody {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
            version,
        };

        let result: AllocResponseBody = self
            .transport
            .post_first(addrs, "/api/v1/internal/alloc", &body)
            .await?;

        Ok((result.remaining_tokens, result.current_version, result.ok))
    }

    pub async fn free(
        &self,
        addrs: &[String],
        namespace: &str,
        resource: &str,
        tokens: i64,
        version: i64,
    ) -> Result<(i64, i64, bool), ClientError> {
        let body = FreeRequestBody {
            namespace: namespace.to_string(),
            resource: resource.to_string(),
            tokens,
            version,
        };

        let result: FreeResponseBody = self
            .transport
            .post_first(addrs, "/api/v1/internal/free", &body)
            .await?;

        Ok((result.remaining_tokens, result.current_version, result.ok))
    }
}

impl Default for AllocClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Memberlist client ─────────────────────────────────────────────────────────

pub struct MemberlistClient {
    http: reqwest::Client,
}

impl MemberlistClient {
    pub fn new() -> Self {
        Self {
            http: build_http_client(),
        }
    }

    /// Fetches the member directory from the first address that answers.
    pub async fn members(&self, addrs: &[String]) -> Result<Vec<Instance>, ClientError> {
        if addrs.is_empty() {
            return Err(ClientError::NoAddresses);
        }

        for addr in addrs {
            let url = format!("http://{}/api/v1/memberlist", addr);
            let envelope: ResponseBody<MemberlistResponseBody> = match self.fetch(&url).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "memberlist fetch failed");
                    continue;
                }
            };

            match unwrap_envelope(envelope) {
                Ok(result) => return Ok(result.members),
                Err(e) => warn!(addr = %addr, error = %e, "memberlist envelope invalid"),
            }
        }

        Err(ClientError::AllAttemptsFailed)
    }

    async fn fetch(
        &self,
        url: &str,
    ) -> Result<ResponseBody<MemberlistResponseBody>, ClientError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "http status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}

impl Default for MemberlistClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Raft cluster join client ──────────────────────────────────────────────────

pub struct RaftJoinClient {
    transport: Transport,
}

impl RaftJoinClient {
    pub fn new() -> Self {
        Self {
            transport: Transport::new(),
        }
    }

    /// Asks any gossip member (self excluded) to add this replica to every
    /// shard. Retries the full peer set under backoff; errors out when no
    /// peer ever answers.
    pub async fn join(
        &self,
        memberlist: &MemberlistService,
        replica_id: u64,
        raft_addr: &str,
    ) -> Result<bool, ClientError> {
        let body = JoinRequestBody {
            replica_id,
            raft_addr: raft_addr.to_string(),
        };

        let mut backoff = MIN_RETRY_BACKOFF;

        for _ in 0..ATTEMPTS_PER_ADDR {
            let peers: Vec<Instance> = memberlist
                .members()
                .await
                .into_iter()
                .filter(|m| m.hostname != memberlist.self_hostname())
                .collect();

            if peers.is_empty() {
                return Err(ClientError::NoAddresses);
            }

            for peer in &peers {
                let url = format!("http://{}/api/v1/internal/raft/join", peer.http_addr());
                info!(addr = %peer.http_addr(), "trying to join cluster");

                let envelope: ResponseBody<JoinResponseBody> =
                    match self.transport.post_once(&url, &body).await {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(addr = %peer.http_addr(), error = %e, "join request failed");
                            continue;
                        }
                    };

                match unwrap_envelope(envelope) {
                    Ok(result) => return Ok(result.already_member),
                    Err(e) => {
                        warn!(addr = %peer.http_addr(), error = %e, "join answered with an error")
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        }

        Err(ClientError::AllAttemptsFailed)
    }

    /// Asks a peer to remove `replica_id` from every shard.
    pub async fn exit(&self, addrs: &[String], replica_id: u64) -> Result<(), ClientError> {
        let body = ExitRequestBody { replica_id };
        let _: serde_json::Value = self
            .transport
            .post_first(addrs, "/api/v1/internal/raft/exit", &body)
            .await?;
        Ok(())
    }
}

impl Default for RaftJoinClient {
    fn default() -> Self {
        Self::new()
    }
}
