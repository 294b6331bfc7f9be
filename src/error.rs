//! Classified action failures
//!
//! Every action raises an [`ActionError`]. The retry engine never inspects
//! error text: the reason code for funds-related failures is derived once,
//! when a blockchain error is constructed, and everything else is decided
//! from the variant.

use std::fmt;
use thiserror::Error;

/// How the retry engine treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connectivity / timeout - rotate RPC and retry
    Transient,
    /// Ordinary blockchain or software error - retry after backoff
    Recoverable,
    /// Domain logic asked not to retry
    RecoverableNoRetry,
    /// Insufficient funds / gas required - abort on this chain
    FatalFunds,
    /// Not a known failure kind - abort without retry
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Recoverable => "recoverable",
            FailureKind::RecoverableNoRetry => "no_retry",
            FailureKind::FatalFunds => "fatal_funds",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured reason attached to blockchain errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    None,
    InsufficientFunds,
    GasRequired,
}

impl ReasonCode {
    /// Derive the reason from a normalized node message
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient funds") {
            ReasonCode::InsufficientFunds
        } else if lower.contains("gas required") {
            ReasonCode::GasRequired
        } else {
            ReasonCode::None
        }
    }

    pub fn is_funds(&self) -> bool {
        !matches!(self, ReasonCode::None)
    }
}

/// Failure raised by an action or by a chain client call
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    Transient(String),

    #[error("{message}")]
    Blockchain { message: String, reason: ReasonCode },

    #[error("{message}")]
    BlockchainNoRetry { message: String, reason: ReasonCode },

    #[error("{0}")]
    Software(String),

    /// Price impact above the configured limit. Raised by swap adapters
    /// built on this crate; retried like a software error.
    #[error("{0}")]
    PriceImpact(String),

    #[error("{0}")]
    NoRetry(String),

    #[error("Unknown error: {0}")]
    Unknown(eyre::Report),
}

impl From<eyre::Report> for ActionError {
    fn from(report: eyre::Report) -> Self {
        ActionError::Unknown(report)
    }
}

impl ActionError {
    /// Build a retryable blockchain error from a raw node message
    pub fn blockchain(raw: impl AsRef<str>) -> Self {
        let message = normalize_error(raw.as_ref());
        let reason = ReasonCode::from_message(&message);
        ActionError::Blockchain { message, reason }
    }

    /// Build a blockchain error the domain marks as final
    pub fn blockchain_no_retry(raw: impl AsRef<str>) -> Self {
        let message = normalize_error(raw.as_ref());
        let reason = ReasonCode::from_message(&message);
        ActionError::BlockchainNoRetry { message, reason }
    }

    pub fn software(message: impl Into<String>) -> Self {
        ActionError::Software(message.into())
    }

    pub fn no_retry(message: impl Into<String>) -> Self {
        ActionError::NoRetry(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ActionError::Transient(message.into())
    }

    /// Classification used by the retry engine
    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::Transient(_) => FailureKind::Transient,
            ActionError::Blockchain { reason, .. } | ActionError::BlockchainNoRetry { reason, .. }
                if reason.is_funds() =>
            {
                FailureKind::FatalFunds
            }
            ActionError::BlockchainNoRetry { .. } | ActionError::NoRetry(_) => {
                FailureKind::RecoverableNoRetry
            }
            ActionError::Blockchain { .. }
            | ActionError::Software(_)
            | ActionError::PriceImpact(_) => FailureKind::Recoverable,
            ActionError::Unknown(_) => FailureKind::Unknown,
        }
    }

    /// Whether the failure points at the RPC node the client is using
    pub fn suspects_node(&self) -> bool {
        matches!(
            self,
            ActionError::Transient(_)
                | ActionError::Blockchain { .. }
                | ActionError::BlockchainNoRetry { .. }
        )
    }

    pub fn reason(&self) -> ReasonCode {
        match self {
            ActionError::Blockchain { reason, .. } | ActionError::BlockchainNoRetry { reason, .. } => {
                *reason
            }
            _ => ReasonCode::None,
        }
    }
}

/// Extract the node message from a JSON-RPC error payload when present.
///
/// Nodes frequently wrap the useful text as `{"code":-32000,"message":"..."}`
/// somewhere inside the transport error string.
pub fn normalize_error(raw: &str) -> String {
    if let Some(start) = raw.find('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw[start..]) {
            if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
                return message.to_string();
            }
        }
    }
    raw.trim().to_string()
}

/// Transport failures that say nothing about the transaction itself
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "error sending request",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "bad gateway",
    "service unavailable",
];

/// HTTP statuses worth another endpoint
const TRANSIENT_STATUSES: &[&str] = &["429", "502", "503", "504"];

/// Status codes only count next to an HTTP marker, never as bare digits
/// (addresses and amounts in node messages contain arbitrary digit runs).
fn has_transient_status(lower: &str) -> bool {
    TRANSIENT_STATUSES.iter().any(|code| {
        ["status code ", "status: ", "http ", "http error "]
            .iter()
            .any(|prefix| lower.contains(&format!("{}{}", prefix, code)))
    })
}

/// Translate raw transport/RPC error text into a classified error.
///
/// Funds failures are checked first so that a node message mentioning them
/// always reaches the engine as a blockchain error.
pub fn classify_rpc_error(raw: &str) -> ActionError {
    let message = normalize_error(raw);
    if ReasonCode::from_message(&message).is_funds() {
        return ActionError::blockchain(raw);
    }

    let lower = raw.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) || has_transient_status(&lower) {
        return ActionError::Transient(format!("Connection to RPC is not stable: {}", raw.trim()));
    }

    ActionError::blockchain(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_detection() {
        assert_eq!(
            ReasonCode::from_message("insufficient funds for gas * price + value"),
            ReasonCode::InsufficientFunds
        );
        assert_eq!(
            ReasonCode::from_message("gas required exceeds allowance (0)"),
            ReasonCode::GasRequired
        );
        assert_eq!(ReasonCode::from_message("execution reverted"), ReasonCode::None);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ActionError::transient("timeout").kind(), FailureKind::Transient);
        assert_eq!(
            ActionError::blockchain("execution reverted").kind(),
            FailureKind::Recoverable
        );
        assert_eq!(ActionError::software("bad request").kind(), FailureKind::Recoverable);
        assert_eq!(
            ActionError::PriceImpact("impact 3%".into()).kind(),
            FailureKind::Recoverable
        );
        assert_eq!(
            ActionError::no_retry("That bridge is not active!").kind(),
            FailureKind::RecoverableNoRetry
        );
        assert_eq!(
            ActionError::blockchain_no_retry("route closed").kind(),
            FailureKind::RecoverableNoRetry
        );
        assert_eq!(
            ActionError::from(eyre::eyre!("boom")).kind(),
            FailureKind::Unknown
        );
    }

    #[test]
    fn test_funds_takes_precedence_over_no_retry() {
        let err = ActionError::blockchain_no_retry("insufficient funds for transfer");
        assert_eq!(err.kind(), FailureKind::FatalFunds);

        let err = ActionError::blockchain("gas required exceeds allowance");
        assert_eq!(err.kind(), FailureKind::FatalFunds);
    }

    #[test]
    fn test_normalize_extracts_rpc_message() {
        let raw = r#"server returned an error response: {"code":-32000,"message":"insufficient funds for gas"}"#;
        assert_eq!(normalize_error(raw), "insufficient funds for gas");
        assert_eq!(normalize_error("  plain text  "), "plain text");
        assert_eq!(normalize_error("broken {json"), "broken {json");
    }

    #[test]
    fn test_classify_rpc_error() {
        assert_eq!(
            classify_rpc_error("error sending request for url").kind(),
            FailureKind::Transient
        );
        assert_eq!(classify_rpc_error("HTTP 503").kind(), FailureKind::Transient);
        assert_eq!(
            classify_rpc_error(r#"{"code":-32000,"message":"insufficient funds"}"#).kind(),
            FailureKind::FatalFunds
        );
        assert_eq!(
            classify_rpc_error("execution reverted: paused").kind(),
            FailureKind::Recoverable
        );
    }

    #[test]
    fn test_funds_error_with_digit_runs_is_fatal() {
        let raw = "server returned an error response: error code -32000: insufficient funds for gas * price + value: address 0x5029aa4f5026eb2a8c1e6f9e6c4b1b9502d40429 have 1000 want 2000503";
        let err = classify_rpc_error(raw);
        assert_eq!(err.kind(), FailureKind::FatalFunds);
        assert_eq!(err.reason(), ReasonCode::InsufficientFunds);

        let raw = r#"connection pool: {"code":-32000,"message":"gas required exceeds allowance (0)"}"#;
        assert_eq!(classify_rpc_error(raw).kind(), FailureKind::FatalFunds);
    }

    #[test]
    fn test_status_codes_need_http_context() {
        assert_eq!(
            classify_rpc_error("HTTP error 429 with body: rate exceeded").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_rpc_error("server returned status code 502").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_rpc_error("execution reverted: order 4295020 expired").kind(),
            FailureKind::Recoverable
        );
    }

    #[test]
    fn test_suspects_node() {
        assert!(ActionError::transient("x").suspects_node());
        assert!(ActionError::blockchain("x").suspects_node());
        assert!(!ActionError::software("x").suspects_node());
        assert!(!ActionError::no_retry("x").suspects_node());
    }
}
