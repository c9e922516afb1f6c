//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.
//!
//! The variants fall into two propagation classes:
//!
//! - **Per-call** -- [`SandboxError::MethodNotFound`],
//!   [`SandboxError::ExecutionTimeout`], [`SandboxError::InvalidArguments`] and
//!   [`SandboxError::Execution`] are delivered only to the caller whose call
//!   produced them.  The session stays usable.
//! - **Session-fatal** -- [`SandboxError::Initialization`],
//!   [`SandboxError::UncaughtPlugin`] and [`SandboxError::UnhandledRejection`]
//!   (once the threshold is reached) terminate the session and are broadcast
//!   to every pending call.

/// Unified error type for the plugin sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    // -- Lifecycle ------------------------------------------------------------
    /// The plugin module failed to compile, link or run its top-level code,
    /// or the worker did not signal readiness within the startup timeout.
    #[error("plugin initialization failed: {message}")]
    Initialization {
        /// Human-readable description of the failure.
        message: String,
        /// Wasm backtrace, when one was captured.
        stack: Option<String>,
    },

    /// The session was shut down (or its worker died) while the call was
    /// outstanding, or a call was issued against a terminated session.
    #[error("sandbox session terminated")]
    SessionTerminated,

    // -- Per-call -------------------------------------------------------------
    /// The plugin instance has no callable export with this name.
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// The call did not settle before its deadline.
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    /// The call arguments do not fit the method's signature.
    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The plugin method trapped or returned a malformed result.
    #[error("plugin execution failed: {message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },

    // -- Asynchronous faults --------------------------------------------------
    /// A fault with no correlating call (memory exhaustion, worker crash).
    /// Fatal to the session.
    #[error("uncaught plugin error: {message}")]
    UncaughtPlugin {
        message: String,
        stack: Option<String>,
    },

    /// An asynchronous plugin fault (e.g. a failing timer callback).  Only
    /// surfaced to callers once repeated faults terminate the session.
    #[error("unhandled rejection in plugin: {message}")]
    UnhandledRejection { message: String },

    // -- Host-side ------------------------------------------------------------
    /// A capability string outside the closed token set.
    #[error("unknown capability token: {0}")]
    UnknownCapability(String),

    /// A log handler was already registered for this session.
    #[error("log handler already registered for session {session_id}")]
    LogHandlerAlreadySet { session_id: String },

    /// The worker could not be started.
    #[error("failed to spawn sandbox worker: {0}")]
    Spawn(String),

    /// A malformed envelope or frame crossed the channel.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid sandbox configuration.
    #[error("invalid sandbox configuration: {0}")]
    Config(String),

    /// An I/O error occurred (e.g. reading a configuration file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether this error ends the session it was raised in.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization { .. }
                | Self::SessionTerminated
                | Self::UncaughtPlugin { .. }
                | Self::UnhandledRejection { .. }
        )
    }
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_error_display() {
        let err = SandboxError::Initialization {
            message: "unknown import: `crypto::sha256` has not been defined".into(),
            stack: None,
        };
        assert_eq!(
            err.to_string(),
            "plugin initialization failed: unknown import: `crypto::sha256` has not been defined"
        );
    }

    #[test]
    fn method_not_found_display() {
        let err = SandboxError::MethodNotFound {
            method: "frobnicate".into(),
        };
        assert_eq!(err.to_string(), "method not found: frobnicate");
    }

    #[test]
    fn timeout_display() {
        let err = SandboxError::ExecutionTimeout { timeout_ms: 30_000 };
        assert_eq!(err.to_string(), "execution timed out after 30000ms");
    }

    #[test]
    fn unknown_capability_display() {
        let err = SandboxError::UnknownCapability("process:spawn".into());
        assert_eq!(err.to_string(), "unknown capability token: process:spawn");
    }

    #[test]
    fn fatal_classification() {
        assert!(SandboxError::SessionTerminated.is_session_fatal());
        assert!(
            SandboxError::UncaughtPlugin {
                message: "oom".into(),
                stack: None
            }
            .is_session_fatal()
        );
        assert!(!SandboxError::ExecutionTimeout { timeout_ms: 1 }.is_session_fatal());
        assert!(
            !SandboxError::MethodNotFound {
                method: "x".into()
            }
            .is_session_fatal()
        );
    }

    #[test]
    fn io_error_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let sandbox_err = SandboxError::from(io_err);
        assert!(sandbox_err.to_string().contains("file gone"));
    }
}
