//! Liveness.

/// Answers liveness probes. Exists as its own component so the supervisor
/// can gate dependents on the HTTP surface actually serving.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingService;

impl PingService {
    pub fn ping(&self) -> &'static str {
        "pong"
    }
}
