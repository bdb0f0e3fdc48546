//! Typed error hierarchy for the vigil kernel.
//!
//! Two top-level enums cover the two subsystems:
//! - `KernelError` — session store, scheduler, tool registry, and agent loop failures
//! - `LlmError` — LLM endpoint failures, split into transient and fatal classes
//!
//! Every error maps to an `ErrorKind` and reports whether a retry can
//! reasonably succeed. Callers print both so an operator can tell a
//! rate-limit stall from a bad API key at a glance.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse error classification shared across subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing configuration.
    Config,
    /// Unknown agent/phase, missing session, or schema violation on tool args.
    Validation,
    /// Cannot write store, deliverable, or workspace state.
    Filesystem,
    /// A tool handler failed.
    Tool,
    /// Transient LLM/network failure (timeout, reset, 5xx, rate limit).
    LlmTransient,
    /// Fatal LLM failure (auth, invalid key, quota exhausted).
    LlmFatal,
    /// An agent failed to produce required deliverables within grace turns.
    NoProgress,
    /// External signal; surfaces as an interrupted session, exit 0.
    Interrupt,
}

impl ErrorKind {
    /// Whether a retry of the failed operation can reasonably succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::LlmTransient)
    }

    /// Stable lowercase label used in audit events and user-facing messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Filesystem => "filesystem",
            Self::Tool => "tool",
            Self::LlmTransient => "llm-transient",
            Self::LlmFatal => "llm-fatal",
            Self::NoProgress => "no-progress",
            Self::Interrupt => "interrupt",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from the kernel: session store, scheduler, registry, agent loop.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Unknown agent: {name}")]
    UnknownAgent { name: String },

    #[error("Unknown phase: {name}")]
    UnknownPhase { name: String },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Tool arguments for {tool} failed validation: {message}")]
    SchemaViolation { tool: String, message: String },

    #[error("Failed to write session store at {path}: {source}")]
    StoreWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write deliverable at {path}: {source}")]
    DeliverableWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path {path} escapes the workspace root {workspace}")]
    SandboxViolation { path: String, workspace: PathBuf },

    #[error("Tool {tool} failed: {message}")]
    ToolFailed {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("Agent {agent} produced no deliverables after {grace_turns} grace turns")]
    NoProgress { agent: String, grace_turns: u32 },

    #[error("Agent {agent} stuck in silence after {nudges} nudges")]
    StuckInSilence { agent: String, nudges: u32 },

    #[error("Interrupted by signal")]
    Interrupted,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KernelError {
    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::SessionNotFound { .. }
            | Self::UnknownAgent { .. }
            | Self::UnknownPhase { .. }
            | Self::UnknownTool { .. }
            | Self::SchemaViolation { .. } => ErrorKind::Validation,
            Self::StoreWriteFailed { .. }
            | Self::DeliverableWriteFailed { .. }
            | Self::SandboxViolation { .. } => ErrorKind::Filesystem,
            Self::ToolFailed { .. } => ErrorKind::Tool,
            Self::NoProgress { .. } | Self::StuckInSilence { .. } => ErrorKind::NoProgress,
            Self::Interrupted => ErrorKind::Interrupt,
            Self::Llm(e) => e.kind(),
            Self::Other(_) => ErrorKind::Tool,
        }
    }

    /// Whether a retry can reasonably succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::ToolFailed { retryable, .. } => *retryable,
            other => other.kind().retryable(),
        }
    }

    /// User-facing one-liner: message plus kind and retryability hint.
    pub fn display_with_kind(&self) -> String {
        format!(
            "{} [kind: {}, retryable: {}]",
            self,
            self.kind(),
            self.retryable()
        )
    }
}

/// Errors from the LLM endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("Model overloaded: {0}")]
    Overloaded(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl LlmError {
    /// Classify a raw error message from the endpoint or the HTTP layer.
    ///
    /// Matches the substrings the upstream providers actually emit: SSE
    /// timeouts, `ECONNRESET`, `fetch failed`, "overloaded", rate-limit
    /// phrasing, and the fatal auth/quota cases.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("invalid api key")
            || lower.contains("invalid x-api-key")
            || lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("permission denied")
        {
            Self::Auth(message.to_string())
        } else if lower.contains("quota") || lower.contains("insufficient credit") {
            Self::QuotaExhausted(message.to_string())
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            Self::RateLimited {
                message: message.to_string(),
            }
        } else if lower.contains("overloaded") {
            Self::Overloaded(message.to_string())
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout(message.to_string())
        } else if lower.contains("econnreset")
            || lower.contains("fetch failed")
            || lower.contains("connection")
            || lower.contains("broken pipe")
        {
            Self::Connection(message.to_string())
        } else {
            Self::MalformedResponse(message.to_string())
        }
    }

    /// Classify an HTTP status code from the endpoint.
    pub fn from_status(status: u16, message: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("HTTP {status}: {message}")),
            402 => Self::QuotaExhausted(format!("HTTP {status}: {message}")),
            429 => Self::RateLimited {
                message: format!("HTTP {status}: {message}"),
            },
            500..=599 => Self::Server {
                status,
                message: message.to_string(),
            },
            _ => Self::MalformedResponse(format!("HTTP {status}: {message}")),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_)
            | Self::Connection(_)
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Overloaded(_) => ErrorKind::LlmTransient,
            Self::Auth(_) | Self::QuotaExhausted(_) => ErrorKind::LlmFatal,
            Self::MalformedResponse(_) => ErrorKind::LlmTransient,
            Self::RetriesExhausted { .. } => ErrorKind::LlmFatal,
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    /// Whether backoff should use the longer rate-limit floor.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_session_not_found_is_validation() {
        let err = KernelError::SessionNotFound {
            id: "abc123".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.retryable());
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn kernel_error_store_write_is_filesystem() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = KernelError::StoreWriteFailed {
            path: PathBuf::from("/var/vigil/sessions.json"),
            source: io_err,
        };
        assert_eq!(err.kind(), ErrorKind::Filesystem);
        assert!(!err.retryable());
    }

    #[test]
    fn kernel_error_tool_failed_carries_retryability() {
        let transient = KernelError::ToolFailed {
            tool: "bash".into(),
            message: "timed out".into(),
            retryable: true,
        };
        assert!(transient.retryable());
        assert_eq!(transient.kind(), ErrorKind::Tool);

        let hard = KernelError::ToolFailed {
            tool: "bash".into(),
            message: "bad args".into(),
            retryable: false,
        };
        assert!(!hard.retryable());
    }

    #[test]
    fn kernel_error_sandbox_violation_carries_paths() {
        let err = KernelError::SandboxViolation {
            path: "/etc/passwd".into(),
            workspace: PathBuf::from("/work/target"),
        };
        match &err {
            KernelError::SandboxViolation { path, workspace } => {
                assert_eq!(path, "/etc/passwd");
                assert_eq!(workspace, &PathBuf::from("/work/target"));
            }
            _ => panic!("Expected SandboxViolation"),
        }
        assert_eq!(err.kind(), ErrorKind::Filesystem);
    }

    #[test]
    fn kernel_error_display_with_kind_includes_hint() {
        let err = KernelError::UnknownAgent {
            name: "recon".into(),
        };
        let msg = err.display_with_kind();
        assert!(msg.contains("kind: validation"));
        assert!(msg.contains("retryable: false"));
    }

    #[test]
    fn llm_classify_rate_limit() {
        let err = LlmError::classify("429 rate limit exceeded, retry later");
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert!(err.retryable());
        assert!(err.is_rate_limit());
    }

    #[test]
    fn llm_classify_auth_is_fatal() {
        let err = LlmError::classify("invalid api key provided");
        assert!(matches!(err, LlmError::Auth(_)));
        assert_eq!(err.kind(), ErrorKind::LlmFatal);
        assert!(!err.retryable());
    }

    #[test]
    fn llm_classify_sse_timeout_is_transient() {
        let err = LlmError::classify("SSE stream timed out after 120s");
        assert!(matches!(err, LlmError::Timeout(_)));
        assert!(err.retryable());
    }

    #[test]
    fn llm_classify_econnreset_is_connection() {
        let err = LlmError::classify("read ECONNRESET");
        assert!(matches!(err, LlmError::Connection(_)));
        assert!(err.retryable());
    }

    #[test]
    fn llm_classify_overloaded() {
        let err = LlmError::classify("model is overloaded, please retry");
        assert!(matches!(err, LlmError::Overloaded(_)));
        assert!(err.retryable());
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn llm_from_status_maps_5xx_transient() {
        let err = LlmError::from_status(503, "service unavailable");
        assert!(matches!(err, LlmError::Server { status: 503, .. }));
        assert!(err.retryable());
    }

    #[test]
    fn llm_from_status_maps_401_fatal() {
        let err = LlmError::from_status(401, "unauthorized");
        assert!(matches!(err, LlmError::Auth(_)));
        assert!(!err.retryable());
    }

    #[test]
    fn llm_retries_exhausted_is_fatal() {
        let err = LlmError::RetriesExhausted {
            attempts: 5,
            last_error: "timeout".into(),
        };
        assert!(!err.retryable());
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn kernel_error_wraps_llm_error_kind() {
        let inner = LlmError::Auth("bad key".into());
        let err: KernelError = inner.into();
        assert_eq!(err.kind(), ErrorKind::LlmFatal);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&KernelError::Interrupted);
        assert_std_error(&LlmError::Timeout("t".into()));
    }
}
