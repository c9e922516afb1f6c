//! Host-side supervisor.
//!
//! The [`Supervisor`] owns every live plugin session.  Each session pairs one
//! isolated worker with a router task that correlates inbound envelopes to
//! outstanding calls by id.
//!
//! Session lifecycle:
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Executing
//!                        |           \         |
//!                        v            v        v
//!                   (create fails)   ShuttingDown -> Terminated
//! ```
//!
//! Guarantees:
//!
//! - Every call settles exactly once: response, error, timeout or
//!   termination, whichever removes its pending entry first.
//! - Session-fatal faults (worker crash, memory exhaustion, too many
//!   unhandled rejections) fail every pending call and refuse new ones.
//! - `shutdown` is idempotent and always leaves the worker stopped, by force
//!   if it does not exit within the grace period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::capability::CapabilityPolicy;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::protocol::{
    ConsolePayload, Envelope, ErrorPayload, INIT_ERROR_ID, LogLevel, MessageType, ReadyPayload,
    ResponsePayload, UNCAUGHT_ERROR_ID, UNHANDLED_REJECTION_ID,
};
use crate::runtime::{RuntimeLimits, WorkerBootstrap};
use crate::transport::{self, WorkerHandle, WorkerLink, WorkerSender};

/// Unique identifier of a session (UUID v7, time-ordered).
pub type SessionId = Uuid;

/// Plugin version reported to the plugin when the caller gives none.
pub const DEFAULT_PLUGIN_VERSION: &str = "0.0.0";

/// Deadline used when a call timeout is too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

type Registry = DashMap<SessionId, SessionHandle>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    /// Whether the session accepts new calls.
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }
}

/// Receiver of sanitized plugin log lines.
pub trait LogHandler: Send + Sync {
    fn handle(&self, level: LogLevel, args: &[Value]);
}

impl<F> LogHandler for F
where
    F: Fn(LogLevel, &[Value]) + Send + Sync,
{
    fn handle(&self, level: LogLevel, args: &[Value]) {
        self(level, args)
    }
}

/// Everything needed to start one plugin session.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub plugin_id: String,
    pub plugin_path: PathBuf,
    pub capabilities: CapabilityPolicy,
    pub plugin_version: String,
}

impl LaunchRequest {
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_path: impl Into<PathBuf>,
        capabilities: CapabilityPolicy,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_path: plugin_path.into(),
            capabilities,
            plugin_version: DEFAULT_PLUGIN_VERSION.to_owned(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.plugin_version = version.into();
        self
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub plugin_id: String,
    pub plugin_path: PathBuf,
    pub capabilities: Vec<String>,
    pub exports: Vec<String>,
    pub state: SessionState,
    pub pending_calls: usize,
    pub unhandled_rejections: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session internals
// ---------------------------------------------------------------------------

type CallOutcome = Result<Value>;

struct PendingCall {
    method: String,
    timeout_ms: u64,
    deadline: Instant,
    sender: oneshot::Sender<CallOutcome>,
}

struct SessionInner {
    id: SessionId,
    plugin_id: String,
    plugin_path: PathBuf,
    capabilities: CapabilityPolicy,
    exports: Vec<String>,
    created_at: DateTime<Utc>,
    call_timeout: Duration,
    shutdown_grace: Duration,
    max_unhandled_rejections: u32,

    // Lock order: `pending` before `state`.
    pending: Mutex<HashMap<String, PendingCall>>,
    state: Mutex<SessionState>,
    sender: WorkerSender,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    log_handler: OnceLock<Arc<dyn LogHandler>>,
    rejections: AtomicU32,
    registry: Weak<Registry>,
}

impl SessionInner {
    /// Remove a pending call, returning the session to `Ready` once idle.
    fn take_pending(&self, call_id: &str) -> Option<PendingCall> {
        let mut pending = lock(&self.pending);
        let call = pending.remove(call_id)?;
        if pending.is_empty() {
            let mut state = lock(&self.state);
            if *state == SessionState::Executing {
                *state = SessionState::Ready;
            }
        }
        Some(call)
    }

    /// Settle a call with the outcome `settle` builds from it.  Late or
    /// unknown ids are discarded.
    fn settle(&self, call_id: &str, settle: impl FnOnce(&PendingCall) -> CallOutcome) {
        let Some(call) = self.take_pending(call_id) else {
            tracing::debug!(session_id = %self.id, call_id, "discarding message for a settled call");
            return;
        };
        let outcome = settle(&call);
        if Instant::now() > call.deadline {
            tracing::debug!(session_id = %self.id, call_id, method = %call.method, "call settled after its deadline");
        }
        let _ = call.sender.send(outcome);
    }

    /// Move to `next` and fail every pending call with errors from `error`.
    fn drain(&self, next: SessionState, error: impl Fn() -> SandboxError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut pending = lock(&self.pending);
            let mut state = lock(&self.state);
            if *state != SessionState::Terminated {
                *state = next;
            }
            pending.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.sender.send(Err(error()));
        }
        count
    }

    fn current_state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Terminate after a session-fatal fault.  The session leaves the
    /// supervisor's registry before any pending call observes the error.
    fn fail(&self, error: impl Fn() -> SandboxError) {
        if matches!(
            self.current_state(),
            SessionState::ShuttingDown | SessionState::Terminated
        ) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        let failed = self.drain(SessionState::Terminated, &error);
        tracing::error!(
            session_id = %self.id,
            plugin_id = %self.plugin_id,
            failed_calls = failed,
            error = %error(),
            "plugin session terminated by fault"
        );
        // Ask a still-running worker to exit; the router reaps it.
        self.sender.send(Envelope::shutdown());
    }

    /// Stop the worker of a session that was terminated by a fault.  A
    /// concurrent or later `shutdown` finds no handle and returns at once.
    async fn reap(&self) {
        let Some(mut handle) = self.worker.lock().await.take() else {
            return;
        };
        if !handle.wait(self.shutdown_grace).await {
            tracing::warn!(session_id = %self.id, "faulted worker did not exit, stopping it");
            handle.force_stop().await;
        }
        tracing::debug!(session_id = %self.id, "faulted worker reaped");
    }

    fn emit_log(&self, level: LogLevel, args: &[Value]) {
        match self.log_handler.get() {
            Some(handler) => handler.handle(level, args),
            None => trace_plugin_log(&self.plugin_id, level, args),
        }
    }

    fn record_rejection(&self, payload: ErrorPayload) {
        let count = self.rejections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            session_id = %self.id,
            plugin_id = %self.plugin_id,
            count,
            message = %payload.message,
            "unhandled rejection in plugin"
        );
        self.emit_log(
            LogLevel::Error,
            &[json!("unhandled rejection"), Value::String(payload.message.clone())],
        );
        if count >= self.max_unhandled_rejections.max(1) {
            let message = payload.message;
            self.fail(|| SandboxError::UnhandledRejection {
                message: message.clone(),
            });
        }
    }

    fn route(&self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Response => match envelope.decode::<ResponsePayload>() {
                Ok(payload) => self.settle(&envelope.id, |_| Ok(payload.result)),
                Err(e) => self.settle(&envelope.id, |_| Err(e)),
            },
            MessageType::Error => {
                let payload = match envelope.decode::<ErrorPayload>() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "malformed error envelope");
                        return;
                    }
                };
                match envelope.id.as_str() {
                    UNCAUGHT_ERROR_ID | INIT_ERROR_ID => self.fail(|| SandboxError::UncaughtPlugin {
                        message: payload.message.clone(),
                        stack: payload.stack.clone(),
                    }),
                    UNHANDLED_REJECTION_ID => self.record_rejection(payload),
                    call_id => self.settle(call_id, |call| {
                        Err(payload.into_call_error(&call.method, call.timeout_ms))
                    }),
                }
            }
            MessageType::Console => match envelope.decode::<ConsolePayload>() {
                Ok(console) => self.emit_log(console.level, &console.args),
                Err(e) => tracing::warn!(session_id = %self.id, error = %e, "malformed console envelope"),
            },
            other => {
                tracing::warn!(session_id = %self.id, kind = ?other, "unexpected envelope from worker, ignoring");
            }
        }
    }

    fn worker_exited(&self) {
        self.fail(|| SandboxError::UncaughtPlugin {
            message: "worker terminated unexpectedly".into(),
            stack: None,
        });
    }
}

/// Forward a plugin log line to `tracing` under the plugin's id.
fn trace_plugin_log(plugin_id: &str, level: LogLevel, args: &[Value]) {
    let rendered = serde_json::to_string(args).unwrap_or_default();
    match level {
        LogLevel::Error => tracing::error!(plugin_id, args = %rendered, "plugin log"),
        LogLevel::Warn => tracing::warn!(plugin_id, args = %rendered, "plugin log"),
        LogLevel::Info => tracing::info!(plugin_id, args = %rendered, "plugin log"),
        LogLevel::Debug => tracing::debug!(plugin_id, args = %rendered, "plugin log"),
        LogLevel::Trace => tracing::trace!(plugin_id, args = %rendered, "plugin log"),
    }
}

/// Correlate worker envelopes with the session until the worker channel
/// closes or the session is dropped.
async fn run_router(session: Weak<SessionInner>, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = inbound.recv().await {
        let Some(inner) = session.upgrade() else {
            return;
        };
        inner.route(envelope);
        if inner.current_state() == SessionState::Terminated {
            inner.reap().await;
        }
    }
    if let Some(inner) = session.upgrade() {
        inner.worker_exited();
        if inner.current_state() == SessionState::Terminated {
            inner.reap().await;
        }
    }
}

/// Wait for `ready`, forwarding early log lines to `tracing`.
async fn await_ready(
    plugin_id: &str,
    inbound: &mut mpsc::UnboundedReceiver<Envelope>,
) -> Result<Vec<String>> {
    while let Some(envelope) = inbound.recv().await {
        match envelope.kind {
            MessageType::Ready => return Ok(envelope.decode::<ReadyPayload>()?.exports),
            MessageType::Error => {
                let payload: ErrorPayload = envelope.decode()?;
                return Err(SandboxError::Initialization {
                    message: payload.message,
                    stack: payload.stack,
                });
            }
            MessageType::Console => match envelope.decode::<ConsolePayload>() {
                Ok(console) => trace_plugin_log(plugin_id, console.level, &console.args),
                Err(e) => tracing::warn!(plugin_id, error = %e, "malformed console envelope"),
            },
            other => tracing::warn!(plugin_id, kind = ?other, "unexpected envelope before ready"),
        }
    }
    Err(SandboxError::Initialization {
        message: "worker exited before signalling readiness".into(),
        stack: None,
    })
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cheap, clonable handle to one plugin session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("plugin_id", &self.inner.plugin_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn plugin_path(&self) -> &Path {
        &self.inner.plugin_path
    }

    pub fn capabilities(&self) -> &CapabilityPolicy {
        &self.inner.capabilities
    }

    /// Methods the plugin can be called with.
    pub fn exports(&self) -> &[String] {
        &self.inner.exports
    }

    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    pub fn info(&self) -> SessionInfo {
        let pending_calls = lock(&self.inner.pending).len();
        SessionInfo {
            id: self.inner.id,
            plugin_id: self.inner.plugin_id.clone(),
            plugin_path: self.inner.plugin_path.clone(),
            capabilities: self.inner.capabilities.to_strings(),
            exports: self.inner.exports.clone(),
            state: self.state(),
            pending_calls,
            unhandled_rejections: self.inner.rejections.load(Ordering::SeqCst),
            created_at: self.inner.created_at,
        }
    }

    /// Call `method` with the session's default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_timeout(method, args, self.inner.call_timeout)
            .await
    }

    /// Call `method`, failing with [`SandboxError::ExecutionTimeout`] if it
    /// does not settle within `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let inner = &self.inner;
        let timeout_ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let call_id = Uuid::now_v7().to_string();
        let now = Instant::now();
        let deadline = now
            .checked_add(Duration::from_millis(timeout_ms))
            .unwrap_or(now + FAR_FUTURE);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut pending = lock(&inner.pending);
            let mut state = lock(&inner.state);
            if !state.accepts_calls() {
                return Err(SandboxError::SessionTerminated);
            }
            *state = SessionState::Executing;
            pending.insert(
                call_id.clone(),
                PendingCall {
                    method: method.to_owned(),
                    timeout_ms,
                    deadline,
                    sender: tx,
                },
            );
        }

        tracing::debug!(session_id = %inner.id, %call_id, method, timeout_ms, "dispatching call");
        if !inner
            .sender
            .send(Envelope::call(&call_id, method, args, timeout_ms))
        {
            inner.take_pending(&call_id);
            return Err(SandboxError::SessionTerminated);
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SandboxError::SessionTerminated),
            Err(_) => match inner.take_pending(&call_id) {
                Some(_) => {
                    tracing::warn!(session_id = %inner.id, %call_id, method, timeout_ms, "call timed out");
                    Err(SandboxError::ExecutionTimeout { timeout_ms })
                }
                // Settled concurrently with the deadline; deliver that outcome.
                None => rx.await.unwrap_or(Err(SandboxError::SessionTerminated)),
            },
        }
    }

    /// Register the session's log handler.  At most one handler may be set.
    pub fn on_log<H>(&self, handler: H) -> Result<()>
    where
        H: LogHandler + 'static,
    {
        self.inner
            .log_handler
            .set(Arc::new(handler))
            .map_err(|_| SandboxError::LogHandlerAlreadySet {
                session_id: self.inner.id.to_string(),
            })
    }

    /// Shut the session down.  Pending calls fail with
    /// [`SandboxError::SessionTerminated`]; the worker gets the grace period
    /// to run its cleanup before being stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        let mut worker = inner.worker.lock().await;
        let Some(mut handle) = worker.take() else {
            return Ok(());
        };

        let failed = inner.drain(SessionState::ShuttingDown, || SandboxError::SessionTerminated);
        tracing::info!(session_id = %inner.id, plugin_id = %inner.plugin_id, failed_calls = failed, "shutting down plugin session");

        inner.sender.send(Envelope::shutdown());
        if !handle.wait(inner.shutdown_grace).await {
            tracing::warn!(
                session_id = %inner.id,
                grace_ms = u64::try_from(inner.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
                "worker did not exit within grace period, stopping it"
            );
            handle.force_stop().await;
        }

        *lock(&inner.state) = SessionState::Terminated;
        tracing::info!(session_id = %inner.id, "plugin session terminated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Creates, tracks and tears down plugin sessions.
pub struct Supervisor {
    config: SandboxConfig,
    sessions: Arc<Registry>,
}

impl Supervisor {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: SandboxConfig::default(),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Start a session for the plugin at `plugin_path`, granting the
    /// capability tokens in `capabilities`.
    pub async fn create<I, S>(
        &self,
        plugin_id: &str,
        plugin_path: impl AsRef<Path>,
        capabilities: I,
    ) -> Result<SessionHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = CapabilityPolicy::parse(capabilities)?;
        self.create_with(LaunchRequest::new(
            plugin_id,
            plugin_path.as_ref(),
            capabilities,
        ))
        .await
    }

    /// Start a session from a full [`LaunchRequest`].
    ///
    /// Resolves once the worker has evaluated the plugin and reported
    /// `ready`.  Fails with [`SandboxError::Initialization`] if evaluation
    /// faults, an ungranted capability is referenced, or the startup timeout
    /// elapses.
    pub async fn create_with(&self, request: LaunchRequest) -> Result<SessionHandle> {
        let id = Uuid::now_v7();
        let mut state = SessionState::Uninitialized;
        tracing::info!(
            session_id = %id,
            plugin_id = %request.plugin_id,
            path = %request.plugin_path.display(),
            capabilities = ?request.capabilities.to_strings(),
            isolation = ?self.config.isolation,
            "creating plugin session"
        );

        let bootstrap = WorkerBootstrap {
            plugin_id: request.plugin_id.clone(),
            plugin_path: request.plugin_path.clone(),
            plugin_version: request.plugin_version.clone(),
            capabilities: request.capabilities.clone(),
            environment: self.config.environment.clone(),
            limits: RuntimeLimits::from_config(&self.config),
        };
        let WorkerLink {
            sender,
            mut inbound,
            mut handle,
        } = transport::spawn_worker(bootstrap, &self.config)?;
        state = advance(id, state, SessionState::Initializing);

        let startup = self.config.startup_timeout();
        let exports = match tokio::time::timeout(startup, await_ready(&request.plugin_id, &mut inbound)).await {
            Ok(Ok(exports)) => exports,
            Ok(Err(err)) => {
                tracing::warn!(session_id = %id, error = %err, "plugin session failed to start");
                handle.force_stop().await;
                return Err(err);
            }
            Err(_) => {
                tracing::warn!(session_id = %id, timeout_ms = self.config.startup_timeout_ms, "plugin startup timed out");
                handle.force_stop().await;
                return Err(SandboxError::Initialization {
                    message: format!(
                        "plugin did not become ready within {}ms",
                        self.config.startup_timeout_ms
                    ),
                    stack: None,
                });
            }
        };
        state = advance(id, state, SessionState::Ready);

        let inner = Arc::new(SessionInner {
            id,
            plugin_id: request.plugin_id,
            plugin_path: request.plugin_path,
            capabilities: request.capabilities,
            exports,
            created_at: Utc::now(),
            call_timeout: self.config.call_timeout(),
            shutdown_grace: self.config.shutdown_grace(),
            max_unhandled_rejections: self.config.max_unhandled_rejections,
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            sender,
            worker: tokio::sync::Mutex::new(Some(handle)),
            log_handler: OnceLock::new(),
            rejections: AtomicU32::new(0),
            registry: Arc::downgrade(&self.sessions),
        });
        tokio::spawn(run_router(Arc::downgrade(&inner), inbound));

        let session = SessionHandle { inner };
        self.sessions.insert(id, session.clone());
        tracing::info!(session_id = %id, exports = ?session.exports(), "plugin session ready");
        Ok(session)
    }

    /// Invoke `method` on the session with the default call timeout.
    pub async fn call(&self, session: &SessionHandle, method: &str, args: Vec<Value>) -> Result<Value> {
        session.call(method, args).await
    }

    pub async fn call_with_timeout(
        &self,
        session: &SessionHandle,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        session.call_with_timeout(method, args, timeout).await
    }

    /// Register the session's log handler.
    pub fn on_log<H>(&self, session: &SessionHandle, handler: H) -> Result<()>
    where
        H: LogHandler + 'static,
    {
        session.on_log(handler)
    }

    /// Shut a session down and forget it.  Idempotent.  Sessions ended by a
    /// fatal fault have already left the registry.
    pub async fn shutdown(&self, session: &SessionHandle) -> Result<()> {
        session.shutdown().await?;
        self.sessions.remove(&session.id());
        Ok(())
    }

    /// Look up a live session.
    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every tracked session, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Shut down every tracked session.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in handles {
            if let Err(e) = self.shutdown(&session).await {
                tracing::warn!(session_id = %session.id(), error = %e, "failed to shut down session");
            }
        }
    }
}

fn advance(id: SessionId, from: SessionState, to: SessionState) -> SessionState {
    tracing::debug!(session_id = %id, ?from, ?to, "session state change");
    to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_and_executing_accept_calls() {
        assert!(SessionState::Ready.accepts_calls());
        assert!(SessionState::Executing.accepts_calls());
        assert!(!SessionState::Uninitialized.accepts_calls());
        assert!(!SessionState::Initializing.accepts_calls());
        assert!(!SessionState::ShuttingDown.accepts_calls());
        assert!(!SessionState::Terminated.accepts_calls());
    }

    #[test]
    fn closures_are_log_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |level: LogLevel, args: &[Value]| {
            sink.lock().unwrap().push((level, args.to_vec()));
        };
        handler.handle(LogLevel::Info, &[json!("hello")]);
        assert_eq!(seen.lock().unwrap()[0], (LogLevel::Info, vec![json!("hello")]));
    }

    #[test]
    fn launch_request_defaults_version() {
        let request = LaunchRequest::new("demo", "/plugins/demo.wasm", CapabilityPolicy::empty());
        assert_eq!(request.plugin_version, DEFAULT_PLUGIN_VERSION);
        assert_eq!(request.with_version("2.1.0").plugin_version, "2.1.0");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SandboxConfig::default().with_call_timeout_ms(0);
        assert!(matches!(Supervisor::new(config), Err(SandboxError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_capability_fails_before_spawning() {
        let supervisor = Supervisor::with_defaults();
        let err = supervisor
            .create("demo", "/nonexistent.wasm", ["fs:root"])
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownCapability(token) if token == "fs:root"));
        assert!(supervisor.sessions().is_empty());
    }
}
