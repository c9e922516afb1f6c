//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the resource limits and isolation mode applied
//! to every plugin session.  Sensible defaults are provided via the
//! [`Default`] implementation, a builder-style API allows callers to
//! customise individual fields fluently, and the whole structure can be
//! loaded from a TOML file where every field is optional:
//!
//! ```toml
//! memory_limit_bytes = 67108864
//! call_timeout_ms = 10000
//! isolation = "process"
//! worker_binary = "/usr/local/bin/enclave-worker"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// How a session's worker is isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// A dedicated OS thread owning its own wasm store.
    #[default]
    Thread,
    /// A separate `enclave-worker` process speaking length-prefixed frames
    /// over stdin/stdout.
    Process,
}

/// Resource limits and isolation settings for plugin sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum linear memory a plugin may allocate, in bytes.
    ///
    /// Default: **128 MiB**.
    pub memory_limit_bytes: usize,

    /// Default per-call execution timeout, in milliseconds.
    ///
    /// Default: **30 000 ms**.
    pub call_timeout_ms: u64,

    /// Bound on module compilation, top-level evaluation and the `ready`
    /// handshake, in milliseconds.
    ///
    /// Default: **30 000 ms**.
    pub startup_timeout_ms: u64,

    /// How long `shutdown` waits for the worker to exit on its own before
    /// interrupting it, in milliseconds.
    ///
    /// Default: **5 000 ms**.
    pub shutdown_grace_ms: u64,

    /// Maximum number of outstanding timers per session.
    ///
    /// Default: **100**.
    pub max_timers: usize,

    /// Upper bound applied to every requested timer delay, in milliseconds.
    ///
    /// Default: **60 000 ms**.
    pub max_timer_delay_ms: u64,

    /// Nesting depth after which logged composites are replaced by a
    /// placeholder.
    ///
    /// Default: **4**.
    pub log_max_depth: usize,

    /// Number of unhandled asynchronous faults after which the session is
    /// terminated.
    ///
    /// Default: **5**.
    pub max_unhandled_rejections: u32,

    /// Execution environment name exposed to plugins as `SANDBOX_ENV`.
    ///
    /// Default: **"production"**.
    pub environment: String,

    /// Worker isolation mode.
    ///
    /// Default: [`IsolationMode::Thread`].
    pub isolation: IsolationMode,

    /// Path of the `enclave-worker` executable used in process mode.  When
    /// unset, the binary is looked up next to the current executable.
    pub worker_binary: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 128 * 1024 * 1024,
            call_timeout_ms: 30_000,
            startup_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            max_timers: 100,
            max_timer_delay_ms: 60_000,
            log_max_depth: 4,
            max_unhandled_rejections: 5,
            environment: "production".to_owned(),
            isolation: IsolationMode::Thread,
            worker_binary: None,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text.  Missing fields keep their
    /// defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SandboxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "sandbox configuration loaded");
        Ok(config)
    }

    /// Reject values that would make the sandbox unusable.
    pub fn validate(&self) -> Result<()> {
        let zeroes = [
            ("memory_limit_bytes", self.memory_limit_bytes as u64),
            ("call_timeout_ms", self.call_timeout_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("max_timers", self.max_timers as u64),
            ("log_max_depth", self.log_max_depth as u64),
        ];
        for (field, value) in zeroes {
            if value == 0 {
                return Err(SandboxError::Config(format!("{field} must be greater than zero")));
            }
        }
        if self.environment.trim().is_empty() {
            return Err(SandboxError::Config("environment must not be empty".into()));
        }
        Ok(())
    }

    /// Set the memory ceiling (in bytes).
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set the default call timeout (in milliseconds).
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    /// Set the startup timeout (in milliseconds).
    pub fn with_startup_timeout_ms(mut self, ms: u64) -> Self {
        self.startup_timeout_ms = ms;
        self
    }

    /// Set the shutdown grace period (in milliseconds).
    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    /// Set the maximum number of outstanding timers.
    pub fn with_max_timers(mut self, count: usize) -> Self {
        self.max_timers = count;
        self
    }

    /// Set the timer delay clamp (in milliseconds).
    pub fn with_max_timer_delay_ms(mut self, ms: u64) -> Self {
        self.max_timer_delay_ms = ms;
        self
    }

    /// Set the unhandled-rejection threshold.
    pub fn with_max_unhandled_rejections(mut self, count: u32) -> Self {
        self.max_unhandled_rejections = count;
        self
    }

    /// Set the environment name exposed to plugins.
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = name.into();
        self
    }

    /// Select the isolation mode.
    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = mode;
        self
    }

    /// Set the worker executable used in process mode.
    pub fn with_worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(path.into());
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
