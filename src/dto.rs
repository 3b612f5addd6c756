//! Wire types for the HTTP surface.
//!
//! Every JSON response is wrapped in the `{status, msg, result}` envelope.
//! Domain outcomes (quota not found, version mismatch) travel as envelope
//! statuses with HTTP 200 so that proxies can distinguish them from transport
//! failures and stop retrying.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::instance::Instance;

pub const STATUS_OK: i32 = 1001;
pub const STATUS_ALLOC_NOT_FOUND: i32 = 1002;
pub const STATUS_ALLOC_INVALID_VERSION: i32 = 1003;
pub const STATUS_INTERNAL_ERROR: i32 = 1000;

pub const MSG_OK: &str = "ok";

/// The response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody<T> {
    pub status: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> ResponseBody<T> {
    pub fn ok(result: T) -> Self {
        Self {
            status: STATUS_OK,
            msg: MSG_OK.to_string(),
            result: Some(result),
        }
    }

    pub fn error(status: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            msg: msg.into(),
            result: None,
        }
    }
}

/// Maps a storage error onto its envelope status, when it has one.
///
/// Transport and internal failures have no envelope status; they surface as
/// HTTP 500 instead.
pub fn envelope_status(err: &StorageError) -> Option<(i32, &'static str)> {
    match err {
        StorageError::NotFound => Some((STATUS_ALLOC_NOT_FOUND, "not found")),
        StorageError::InvalidVersion => Some((STATUS_ALLOC_INVALID_VERSION, "invalid version")),
        _ => None,
    }
}

// ── Rate tier ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowRequestBody {
    pub namespace: String,
    pub resource: String,
    pub tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowResponseBody {
    /// Nanoseconds the caller should wait before the permit is usable.
    pub wait_time: i64,
    pub ok: bool,
}

// ── Alloc tier ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewRequestBody {
    pub namespace: String,
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewResponseBody {
    pub allocated: i64,
    pub capacity: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocRequestBody {
    pub namespace: String,
    pub resource: String,
    pub tokens: i64,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocResponseBody {
    pub remaining_tokens: i64,
    pub current_version: i64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeRequestBody {
    pub namespace: String,
    pub resource: String,
    pub tokens: i64,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeResponseBody {
    pub remaining_tokens: i64,
    pub current_version: i64,
    pub ok: bool,
}

// ── Membership ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberlistResponseBody {
    pub members: Vec<Instance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponseBody {
    pub msg: String,
}

// ── Raft membership ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestBody {
    pub replica_id: u64,
    pub raft_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponseBody {
    pub already_member: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRequestBody {
    pub replica_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_without_null_result() {
        let body: ResponseBody<ViewResponseBody> =
            ResponseBody::error(STATUS_ALLOC_NOT_FOUND, "not found");
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("result"));
        assert!(json.contains("1002"));
    }

    #[test]
    fn envelope_round_trips() {
        let body = ResponseBody::ok(AllocResponseBody {
            remaining_tokens: 7,
            current_version: 2,
            ok: true,
        });
        let json = serde_json::to_string(&body).unwrap();
        let parsed: ResponseBody<AllocResponseBody> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, STATUS_OK);
        assert_eq!(parsed.result.unwrap().remaining_tokens, 7);
    }

    #[test]
    fn alloc_request_version_defaults_to_zero() {
        let parsed: AllocRequestBody =
            serde_json::from_str(r#"{"namespace":"ns","resource":"res","tokens":3}"#).unwrap();
        assert_eq!(parsed.version, 0);
    }

    #[test]
    fn domain_errors_map_to_envelope_statuses() {
        assert_eq!(
            envelope_status(&StorageError::NotFound),
            Some((STATUS_ALLOC_NOT_FOUND, "not found"))
        );
        assert_eq!(
            envelope_status(&StorageError::InvalidVersion),
            Some((STATUS_ALLOC_INVALID_VERSION, "invalid version"))
        );
        assert_eq!(envelope_status(&StorageError::Closed), None);
    }
}
