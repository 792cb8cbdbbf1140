//! Error kinds surfaced at the gateway boundary.

/// Unified error type for all gateway operations.
///
/// Errors are classified by kind, not by wire format: callers can match on the
/// variant to decide whether to retry, fail over, or give up. `Clone` is
/// required so a single loader failure can be fanned out to every caller
/// coalesced behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The provider's circuit breaker refused admission.
    #[error("circuit open for '{provider}', retry in {remaining_ms}ms")]
    CircuitOpen { provider: String, remaining_ms: u64 },

    /// The load balancer found no healthy provider to select.
    #[error("no healthy provider available")]
    NoHealthyProvider,

    /// The upstream answered with an error status (>= 400).
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: String },

    /// The request exceeded the provider timeout.
    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Connection, DNS, or protocol failure below the HTTP layer.
    #[error("transport error ({kind}): {detail}")]
    Transport { kind: String, detail: String },

    /// The gateway is not started (or already stopped).
    #[error("gateway not started")]
    NotStarted,

    /// No provider registered under the given name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A middleware short-circuited the request.
    #[error("aborted by middleware ({status}): {message}")]
    AbortedByMiddleware { status: u16, message: String },
}

impl GatewayError {
    /// Check if this error came from a circuit breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the retry loop may attempt this request again.
    ///
    /// Only upstream failures are retryable. Breaker rejections, configuration
    /// errors, lifecycle errors, and middleware aborts are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamStatus { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }

    /// Stable kind name, used as the key of `errors_by_type` statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyProvider => "no_healthy_provider",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport",
            Self::NotStarted => "not_started",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::InvalidConfig(_) => "invalid_config",
            Self::AbortedByMiddleware { .. } => "aborted_by_middleware",
        }
    }
}
