//! Error types for the memory subsystem, with retry classification.
//!
//! The embedding provider distinguishes transient failures (throttling,
//! network) from permanent ones (credential/referrer configuration), and
//! cancellation is its own kind so callers can tell an aborted pass from a
//! failed one.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Maximum backoff delay, including jitter.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Error from embedding provider calls.
#[derive(Debug, Clone)]
pub struct EmbedError {
    /// The kind of error
    pub kind: EmbedErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header, when present)
    pub retry_after: Option<Duration>,
}

impl EmbedError {
    /// Create a throttling error (429 / quota / rate limit).
    pub fn throttled(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: EmbedErrorKind::Throttled,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    /// Create a network-class error (connection failed, 5xx, timeout).
    pub fn network(message: String) -> Self {
        Self {
            kind: EmbedErrorKind::Network,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a configuration error (bad key, referrer mismatch).
    ///
    /// The message should tell the operator what to fix, since these are
    /// never retried.
    pub fn configuration(status_code: Option<u16>, message: String) -> Self {
        Self {
            kind: EmbedErrorKind::Configuration,
            status_code,
            message,
            retry_after: None,
        }
    }

    /// Create a response-parsing error.
    pub fn parse(message: String) -> Self {
        Self {
            kind: EmbedErrorKind::Parse,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a cancellation error.
    pub fn cancelled() -> Self {
        Self {
            kind: EmbedErrorKind::Cancelled,
            status_code: None,
            message: "embedding generation cancelled".to_string(),
            retry_after: None,
        }
    }

    /// Create an empty-input error.
    pub fn empty_input() -> Self {
        Self {
            kind: EmbedErrorKind::EmptyInput,
            status_code: None,
            message: "cannot embed empty text".to_string(),
            retry_after: None,
        }
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the delay before the next retry attempt.
    ///
    /// Uses `retry_after` when the provider supplied one, otherwise
    /// exponential backoff from a per-kind base with up to 25% jitter,
    /// capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after.min(MAX_BACKOFF);
        }

        let base_ms: u64 = match self.kind {
            EmbedErrorKind::Throttled => 2_000,
            EmbedErrorKind::Network => 500,
            _ => 500,
        };

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_ms = base_ms.saturating_mul(multiplier);

        let jitter_range = delay_ms / 4;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(delay_ms.saturating_add(jitter)).min(MAX_BACKOFF)
    }
}

impl std::fmt::Display for EmbedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for EmbedError {}

/// Classification of embedding provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedErrorKind {
    /// Rate limited or out of quota - transient, retry with backoff
    Throttled,
    /// Network or server failure - transient, retry with backoff
    Network,
    /// Credential or referrer misconfiguration - permanent, never retried
    Configuration,
    /// Response could not be parsed - permanent
    Parse,
    /// The call or a pending backoff sleep was cancelled
    Cancelled,
    /// Empty input text was rejected before any network call
    EmptyInput,
}

impl EmbedErrorKind {
    /// Check if this error kind is transient (should retry).
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedErrorKind::Throttled | EmbedErrorKind::Network)
    }
}

impl std::fmt::Display for EmbedErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedErrorKind::Throttled => write!(f, "Throttled"),
            EmbedErrorKind::Network => write!(f, "Network error"),
            EmbedErrorKind::Configuration => write!(f, "Configuration error"),
            EmbedErrorKind::Parse => write!(f, "Parse error"),
            EmbedErrorKind::Cancelled => write!(f, "Cancelled"),
            EmbedErrorKind::EmptyInput => write!(f, "Empty input"),
        }
    }
}

/// Classify an embedding provider HTTP response into an error.
///
/// Auth and referrer failures are configuration errors and fail fast with a
/// remediation-oriented message; 429 and quota/rate-limit/throttle bodies are
/// throttling; everything else at the HTTP layer is network-class.
pub fn classify_provider_error(status: u16, body: &str) -> EmbedError {
    let lower = body.to_lowercase();

    if status == 401 || status == 403 || lower.contains("referer") || lower.contains("referrer") {
        return EmbedError::configuration(
            Some(status),
            format!(
                "embedding provider rejected the credential; check the API key \
                 and any referrer restriction configured for it: {}",
                body
            ),
        );
    }

    if status == 429
        || lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("throttl")
    {
        return EmbedError {
            kind: EmbedErrorKind::Throttled,
            status_code: Some(status),
            message: body.to_string(),
            retry_after: None,
        };
    }

    EmbedError::network(format!("embedding provider error (HTTP {}): {}", status, body))
}

/// Errors from the partition store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector store connection failed: {0}")]
    Connection(String),

    #[error("vector store backend error: {0}")]
    Backend(String),

    #[error("row decoding failed: {0}")]
    Decode(String),
}

/// Validation failures for write messages. Item-local: one invalid message
/// never fails its batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message body is not valid JSON: {0}")]
    Malformed(String),

    #[error("insert/update requires at least one of records or rawFacts")]
    MissingRecords,

    #[error("rawFacts require a workspaceId")]
    MissingWorkspace,

    #[error("delete requires recordIds")]
    MissingRecordIds,
}

/// Errors from the credit reservation guard.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CreditError {
    #[error("Insufficient credits: need {needed}, have {available}")]
    Insufficient { needed: u64, available: u64 },

    #[error("Unknown or already resolved reservation: {0}")]
    UnknownReservation(String),
}
