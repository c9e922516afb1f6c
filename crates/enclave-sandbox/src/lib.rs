//! Enclave plugin sandbox.
//!
//! Runs untrusted WebAssembly plugins in isolated workers and exposes them to
//! the host through a message-passing supervisor.
//!
//! - **[`supervisor`]** -- [`Supervisor`] creates sessions, dispatches calls
//!   with per-call timeouts, routes plugin logs, and shuts workers down.
//! - **[`runtime`]** -- the worker side: loads one plugin under a
//!   capability-filtered import namespace and serves calls sequentially.
//! - **[`capability`]** -- [`CapabilityToken`] and the immutable
//!   [`CapabilityPolicy`] fixed at session creation.
//! - **[`limiter`]** -- memory ceiling and timer budget enforced per store.
//! - **[`sanitize`]** -- [`LogSanitizer`] redacts sensitive keys before a log
//!   line leaves the worker.
//! - **[`protocol`]** / **[`codec`]** -- the [`Envelope`] message set and its
//!   frame encoding for process isolation.
//! - **[`transport`]** -- thread and process workers behind one channel
//!   abstraction.
//! - **[`config`]** -- [`SandboxConfig`], loadable from TOML.
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.
//!
//! All public host-side types are `Send + Sync` and meant for use inside a
//! multi-threaded tokio runtime.

pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod limiter;
pub mod protocol;
pub mod runtime;
pub mod sanitize;
pub mod supervisor;
pub mod transport;

// Re-export the most commonly used types at the crate root.
pub use capability::{CapabilityPolicy, CapabilityToken};
pub use config::{IsolationMode, SandboxConfig};
pub use error::{Result, SandboxError};
pub use protocol::{Envelope, LogLevel};
pub use runtime::{PluginReport, WorkerBootstrap, describe_plugin, run_worker};
pub use sanitize::LogSanitizer;
pub use supervisor::{
    LaunchRequest, LogHandler, SessionHandle, SessionId, SessionInfo, SessionState, Supervisor,
};
