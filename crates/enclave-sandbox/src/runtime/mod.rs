//! Isolated worker runtime.
//!
//! A worker owns exactly one plugin instance.  It compiles and instantiates
//! the module against a capability-filtered linker, announces the callable
//! methods with `ready`, then serves `call` envelopes strictly one at a time
//! until it receives `shutdown` or its inbox closes.  Between calls it fires
//! timers the plugin registered.
//!
//! Guest execution is preemptible: an epoch ticker thread advances the engine
//! clock, and the store's epoch callback aborts guest code once the active
//! deadline passes or the host raises the interrupt flag.
//!
//! The worker never sees host objects.  Everything it receives and sends is
//! an [`Envelope`], delivered through an [`EnvelopeSink`].

pub mod abi;
pub mod globals;
mod host;

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wasmtime::{Engine, ExternType, Instance, Module, Store, WasmBacktrace};

use crate::capability::{CapabilityPolicy, CapabilityToken};
use crate::config::SandboxConfig;
use crate::error::{Result as SandboxResult, SandboxError};
use crate::limiter::{DueTimer, LimitError, MemoryLimiter, TimerQueue};
use crate::protocol::{
    CallPayload, Envelope, ErrorKind, ErrorPayload, INIT_ERROR_ID, MessageType,
    UNCAUGHT_ERROR_ID, UNHANDLED_REJECTION_ID,
};
use crate::sanitize::LogSanitizer;

use self::abi::{AbiError, JSON_EXPORT_PREFIX, Target};
use self::globals::{is_host_control, is_provided};
use self::host::{HostState, Interrupt, ProcessInfo};

/// Interval at which the engine epoch advances.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Exports that belong to the plugin lifecycle and are never dispatchable.
pub const RESERVED_EXPORTS: [&str; 7] = [
    "memory",
    "alloc",
    "constructor",
    "cleanup",
    "on_timer",
    "_initialize",
    "_start",
];

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Worker-to-host channel.
pub trait EnvelopeSink: Send + Sync {
    /// Deliver one envelope.  Returns `false` once the host side is gone.
    fn send(&self, envelope: Envelope) -> bool;
}

impl EnvelopeSink for tokio::sync::mpsc::UnboundedSender<Envelope> {
    fn send(&self, envelope: Envelope) -> bool {
        tokio::sync::mpsc::UnboundedSender::send(self, envelope).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Limits a worker enforces on its own store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLimits {
    pub memory_limit_bytes: usize,
    pub startup_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub max_timers: usize,
    pub max_timer_delay_ms: u64,
    pub log_max_depth: usize,
}

impl RuntimeLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            startup_timeout_ms: config.startup_timeout_ms,
            call_timeout_ms: config.call_timeout_ms,
            max_timers: config.max_timers,
            max_timer_delay_ms: config.max_timer_delay_ms,
            log_max_depth: config.log_max_depth,
        }
    }
}

/// Everything a worker needs to load one plugin.  Serializable so process
/// workers can receive it on their command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub plugin_id: String,
    pub plugin_path: PathBuf,
    pub plugin_version: String,
    pub capabilities: CapabilityPolicy,
    pub environment: String,
    pub limits: RuntimeLimits,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one worker to completion on the current thread.
///
/// Sends `ready` (or `error{id: "init"}`), then serves the inbox.  A panic
/// anywhere in the worker is reported as an uncaught fault instead of
/// unwinding into the caller.
pub fn run_worker(
    bootstrap: WorkerBootstrap,
    inbox: Receiver<Envelope>,
    sink: Arc<dyn EnvelopeSink>,
    interrupt: Arc<AtomicBool>,
) {
    let plugin_id = bootstrap.plugin_id.clone();
    let panic_sink = Arc::clone(&sink);

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
        match WorkerRuntime::load(&bootstrap, Arc::clone(&sink), interrupt) {
            Ok(runtime) => {
                tracing::info!(
                    plugin_id = %bootstrap.plugin_id,
                    exports = ?runtime.exports,
                    "plugin ready"
                );
                sink.send(Envelope::ready(runtime.exports.clone()));
                runtime.serve(inbox);
            }
            Err(payload) => {
                tracing::warn!(plugin_id = %bootstrap.plugin_id, error = %payload.message, "plugin failed to initialize");
                sink.send(Envelope::error(INIT_ERROR_ID, payload));
            }
        }
    }));

    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "worker panicked".to_owned());
        tracing::error!(%plugin_id, %message, "worker panicked");
        panic_sink.send(Envelope::error(
            UNCAUGHT_ERROR_ID,
            ErrorPayload::new(ErrorKind::Uncaught, format!("worker panicked: {message}")),
        ));
    }
}

// ---------------------------------------------------------------------------
// Epoch ticker
// ---------------------------------------------------------------------------

/// Advances the engine epoch until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: &Engine, plugin_id: &str) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let engine = engine.clone();
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("epoch-{plugin_id}"))
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Classified failure of guest code.
#[derive(Debug)]
enum Fault {
    TimedOut { timeout_ms: u64 },
    Interrupted,
    MemoryExhausted { message: String },
    Trap { message: String, stack: Option<String> },
}

impl Fault {
    fn classify(err: &wasmtime::Error, limiter_tripped: bool) -> Self {
        if let Some(interrupt) = err.chain().find_map(|e| e.downcast_ref::<Interrupt>()) {
            return match interrupt {
                Interrupt::TimedOut { timeout_ms } => Self::TimedOut {
                    timeout_ms: *timeout_ms,
                },
                Interrupt::Killed => Self::Interrupted,
            };
        }
        let limit = err.chain().find_map(|e| e.downcast_ref::<LimitError>());
        if limiter_tripped || matches!(limit, Some(LimitError::MemoryExceeded { .. })) {
            return Self::MemoryExhausted {
                message: err.root_cause().to_string(),
            };
        }
        Self::Trap {
            message: err.root_cause().to_string(),
            stack: err.downcast_ref::<WasmBacktrace>().map(ToString::to_string),
        }
    }

    fn into_payload(self, kind: ErrorKind) -> ErrorPayload {
        match self {
            Self::TimedOut { timeout_ms } => ErrorPayload::new(
                ErrorKind::Timeout,
                format!("execution timed out after {timeout_ms}ms"),
            ),
            Self::Interrupted => ErrorPayload::new(kind, "execution interrupted by the host"),
            Self::MemoryExhausted { message } => ErrorPayload::new(ErrorKind::Uncaught, message),
            Self::Trap { message, stack } => ErrorPayload::new(kind, message).with_stack(stack),
        }
    }
}

/// Whether the worker loop keeps going after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

struct WorkerRuntime {
    store: Store<HostState>,
    instance: Instance,
    exports: Vec<String>,
    has_constructor: bool,
    constructed: bool,
    call_timeout: Duration,
    // Declared last so the store is dropped before the ticker joins.
    _ticker: EpochTicker,
}

fn init_error(message: impl Into<String>) -> ErrorPayload {
    ErrorPayload::new(ErrorKind::Initialization, message)
}

impl WorkerRuntime {
    /// Compile, link and evaluate the plugin under the startup deadline.
    fn load(
        bootstrap: &WorkerBootstrap,
        sink: Arc<dyn EnvelopeSink>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, ErrorPayload> {
        let limits = &bootstrap.limits;
        let startup = Duration::from_millis(limits.startup_timeout_ms);
        let started = Instant::now();

        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        config.wasm_backtrace(true);
        let engine = Engine::new(&config)
            .map_err(|e| init_error(format!("failed to create wasm engine: {e}")))?;
        let ticker = EpochTicker::start(&engine, &bootstrap.plugin_id)
            .map_err(|e| init_error(format!("failed to start epoch ticker: {e}")))?;

        let module = Module::from_file(&engine, &bootstrap.plugin_path).map_err(|e| {
            init_error(format!(
                "failed to load plugin {}: {e:#}",
                bootstrap.plugin_path.display()
            ))
        })?;
        if started.elapsed() >= startup {
            return Err(init_error(format!(
                "plugin startup exceeded {}ms during compilation",
                limits.startup_timeout_ms
            )));
        }

        let state = HostState {
            process_info: ProcessInfo {
                environment: bootstrap.environment.clone(),
                plugin_id: bootstrap.plugin_id.clone(),
                plugin_version: bootstrap.plugin_version.clone(),
            },
            limiter: MemoryLimiter::new(limits.memory_limit_bytes),
            timers: TimerQueue::new(
                limits.max_timers,
                Duration::from_millis(limits.max_timer_delay_ms),
            ),
            sanitizer: LogSanitizer::new(limits.log_max_depth),
            sink,
            deadline: None,
            interrupt,
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|state| &mut state.limiter);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(host::check_deadline);

        let linker = globals::build_linker(&engine, &module, &bootstrap.capabilities)
            .map_err(|e| init_error(format!("failed to build host imports: {e}")))?;

        // Remaining startup budget covers the start function and `_initialize`.
        store
            .data_mut()
            .arm(startup.saturating_sub(started.elapsed()));
        let evaluated = linker
            .instantiate(&mut store, &module)
            .and_then(|instance| {
                if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
                    init.call(&mut store, ())?;
                }
                Ok(instance)
            });
        store.data_mut().disarm();

        let instance = evaluated.map_err(|err| {
            let tripped = store.data().limiter.exceeded();
            match Fault::classify(&err, tripped) {
                Fault::TimedOut { .. } => init_error(format!(
                    "plugin startup exceeded {}ms",
                    limits.startup_timeout_ms
                )),
                Fault::Interrupted => init_error("plugin startup interrupted by the host"),
                Fault::MemoryExhausted { message } => init_error(message),
                Fault::Trap { message, stack } => init_error(message).with_stack(stack),
            }
        })?;

        let has_constructor = instance
            .get_typed_func::<(), ()>(&mut store, "constructor")
            .is_ok();

        Ok(Self {
            exports: callable_exports(&module),
            store,
            instance,
            has_constructor,
            constructed: false,
            call_timeout: Duration::from_millis(limits.call_timeout_ms),
            _ticker: ticker,
        })
    }

    fn send(&self, envelope: Envelope) {
        self.store.data().send(envelope);
    }

    fn interrupted(&self) -> bool {
        self.store.data().interrupt.load(Ordering::Relaxed)
    }

    /// Serve the inbox until shutdown, disconnect, or a fatal fault.
    fn serve(mut self, inbox: Receiver<Envelope>) {
        let plugin_id = self.store.data().process_info.plugin_id.clone();
        loop {
            if self.interrupted() {
                tracing::warn!(%plugin_id, "worker interrupted by host");
                return;
            }

            let next_timer = self.store.data().timers.next_deadline();
            let received = match next_timer {
                Some(at) => inbox.recv_timeout(at.saturating_duration_since(Instant::now())),
                None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            let flow = match received {
                Ok(envelope) => match envelope.kind {
                    // Timers that came due while the call ran fire before the
                    // next queued envelope is taken.
                    MessageType::Call => match self.handle_call(envelope) {
                        Flow::Continue => self.fire_due_timers(),
                        Flow::Exit => Flow::Exit,
                    },
                    MessageType::Shutdown => {
                        self.run_cleanup();
                        tracing::info!(%plugin_id, "worker shut down");
                        Flow::Exit
                    }
                    other => {
                        tracing::warn!(%plugin_id, kind = ?other, "unexpected envelope from host, ignoring");
                        Flow::Continue
                    }
                },
                Err(RecvTimeoutError::Timeout) => self.fire_due_timers(),
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!(%plugin_id, "host channel closed");
                    Flow::Exit
                }
            };

            if flow == Flow::Exit {
                return;
            }
        }
    }

    fn handle_call(&mut self, envelope: Envelope) -> Flow {
        let call: CallPayload = match envelope.decode() {
            Ok(call) => call,
            Err(e) => {
                self.send(Envelope::error(
                    envelope.id,
                    ErrorPayload::new(ErrorKind::InvalidArguments, e.to_string()),
                ));
                return Flow::Continue;
            }
        };
        tracing::debug!(call_id = %envelope.id, method = %call.method, "dispatching call");

        let timeout = Duration::from_millis(call.timeout_ms.max(1));
        match self.dispatch(&call.method, &call.args, timeout) {
            Ok(result) => {
                self.send(Envelope::response(envelope.id, result));
                Flow::Continue
            }
            Err(Dispatch::Rejected(payload)) => {
                self.send(Envelope::error(envelope.id, payload));
                Flow::Continue
            }
            Err(Dispatch::Faulted(fault)) => self.report_fault(&envelope.id, fault),
        }
    }

    /// Report a guest fault against `call_id`, escalating session-fatal ones.
    fn report_fault(&mut self, call_id: &str, fault: Fault) -> Flow {
        match fault {
            Fault::Interrupted => Flow::Exit,
            Fault::MemoryExhausted { message } => {
                tracing::error!(%message, "plugin exceeded its memory limit");
                self.send(Envelope::error(
                    UNCAUGHT_ERROR_ID,
                    ErrorPayload::new(
                        ErrorKind::Uncaught,
                        format!("plugin exceeded its memory limit: {message}"),
                    ),
                ));
                Flow::Exit
            }
            fault => {
                self.send(Envelope::error(call_id, fault.into_payload(ErrorKind::Execution)));
                Flow::Continue
            }
        }
    }

    fn dispatch(&mut self, method: &str, args: &[Value], timeout: Duration) -> Result<Value, Dispatch> {
        if RESERVED_EXPORTS.contains(&method) || method.starts_with(JSON_EXPORT_PREFIX) {
            return Err(Dispatch::not_found(method));
        }
        let target = abi::resolve(&self.instance, &mut self.store, method)
            .ok_or_else(|| Dispatch::not_found(method))?;

        self.store.data_mut().arm(timeout);
        let outcome = self
            .ensure_constructed()
            .map_err(AbiError::Trap)
            .and_then(|()| abi::invoke(&self.instance, &mut self.store, target, args));
        self.store.data_mut().disarm();

        outcome.map_err(|err| match err {
            AbiError::InvalidArguments(reason) => {
                Dispatch::Rejected(ErrorPayload::new(ErrorKind::InvalidArguments, reason))
            }
            AbiError::Unsupported(reason) => Dispatch::Rejected(ErrorPayload::new(
                ErrorKind::Execution,
                format!("method `{method}` cannot be called: {reason}"),
            )),
            AbiError::Trap(err) => {
                Dispatch::Faulted(Fault::classify(&err, self.store.data().limiter.exceeded()))
            }
        })
    }

    /// Run the plugin's `constructor` export once, before the first call.
    fn ensure_constructed(&mut self) -> wasmtime::Result<()> {
        if !self.has_constructor || self.constructed {
            return Ok(());
        }
        let constructor = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "constructor")?;
        constructor.call(&mut self.store, ())?;
        self.constructed = true;
        tracing::debug!("plugin instance constructed");
        Ok(())
    }

    /// Deliver every due timer to the plugin's `on_timer` export.  Failures
    /// are reported as unhandled rejections; memory exhaustion stays fatal.
    fn fire_due_timers(&mut self) -> Flow {
        let due = self.store.data_mut().timers.take_due(Instant::now());
        for DueTimer { id, token } in due {
            tracing::trace!(timer_id = id, token, "timer fired");
            let Ok(on_timer) = self
                .instance
                .get_typed_func::<i32, ()>(&mut self.store, "on_timer")
            else {
                self.send(Envelope::error(
                    UNHANDLED_REJECTION_ID,
                    ErrorPayload::new(
                        ErrorKind::UnhandledRejection,
                        format!("timer {id} fired but the plugin exports no `on_timer(i32)` handler"),
                    ),
                ));
                continue;
            };

            self.store.data_mut().arm(self.call_timeout);
            let result = on_timer.call(&mut self.store, token);
            self.store.data_mut().disarm();

            if let Err(err) = result {
                let fault = Fault::classify(&err, self.store.data().limiter.exceeded());
                match fault {
                    Fault::Interrupted | Fault::MemoryExhausted { .. } => {
                        return self.report_fault(UNCAUGHT_ERROR_ID, fault);
                    }
                    fault => {
                        let mut payload = fault.into_payload(ErrorKind::UnhandledRejection);
                        payload.kind = ErrorKind::UnhandledRejection;
                        payload.message = format!("timer {id} callback failed: {}", payload.message);
                        self.send(Envelope::error(UNHANDLED_REJECTION_ID, payload));
                    }
                }
            }
        }
        Flow::Continue
    }

    /// Run the plugin's `cleanup` export, if any, bounded by the call timeout.
    fn run_cleanup(&mut self) {
        if self.has_constructor && !self.constructed {
            return;
        }
        let Ok(cleanup) = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "cleanup")
        else {
            return;
        };
        self.store.data_mut().arm(self.call_timeout);
        if let Err(err) = cleanup.call(&mut self.store, ()) {
            tracing::warn!(error = %err.root_cause(), "plugin cleanup failed");
        }
        self.store.data_mut().disarm();
    }
}

/// Why a dispatched call produced no result.
enum Dispatch {
    /// The call never ran guest code, or the guest rejected its input.
    Rejected(ErrorPayload),
    /// Guest code faulted.
    Faulted(Fault),
}

impl Dispatch {
    fn not_found(method: &str) -> Self {
        Self::Rejected(ErrorPayload::new(
            ErrorKind::MethodNotFound,
            format!("plugin has no method `{method}`"),
        ))
    }
}

/// Method names the plugin can be called with, sorted and deduplicated.
pub fn callable_exports(module: &Module) -> Vec<String> {
    let methods: BTreeSet<String> = module
        .exports()
        .filter(|export| matches!(export.ty(), ExternType::Func(_)))
        .map(|export| {
            export
                .name()
                .strip_prefix(JSON_EXPORT_PREFIX)
                .unwrap_or(export.name())
                .to_owned()
        })
        .filter(|name| !name.is_empty() && !RESERVED_EXPORTS.contains(&name.as_str()))
        .collect();
    methods.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// One import a plugin declares, and what it takes to satisfy it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRequirement {
    pub module: String,
    pub name: String,
    /// Capability that must be granted for the import to resolve.
    pub capability: Option<CapabilityToken>,
    /// Resolves to a stub that traps when called.
    pub host_control: bool,
    /// Cannot be satisfied under any capability set.
    pub unresolvable: bool,
}

/// Static description of a plugin module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginReport {
    pub methods: Vec<String>,
    pub imports: Vec<ImportRequirement>,
    pub has_constructor: bool,
    pub has_cleanup: bool,
    pub has_timer_handler: bool,
}

impl PluginReport {
    /// Capabilities the plugin needs for all of its imports to resolve.
    pub fn required_capabilities(&self) -> CapabilityPolicy {
        self.imports.iter().filter_map(|i| i.capability).collect()
    }
}

/// Compile a plugin and describe its methods and imports without running it.
pub fn describe_plugin(path: &std::path::Path) -> SandboxResult<PluginReport> {
    let engine = Engine::default();
    let module = Module::from_file(&engine, path).map_err(|e| SandboxError::Initialization {
        message: format!("failed to load plugin {}: {e:#}", path.display()),
        stack: None,
    })?;

    let export_names: BTreeSet<&str> = module.exports().map(|e| e.name()).collect();
    let imports = module
        .imports()
        .map(|import| {
            let is_func = matches!(import.ty(), ExternType::Func(_));
            let host_control = is_host_control(import.module()) && is_func;
            ImportRequirement {
                module: import.module().to_owned(),
                name: import.name().to_owned(),
                capability: CapabilityToken::for_import_module(import.module()),
                host_control,
                unresolvable: !host_control && !(is_func && is_provided(import.module(), import.name())),
            }
        })
        .collect();

    Ok(PluginReport {
        methods: callable_exports(&module),
        imports,
        has_constructor: export_names.contains("constructor"),
        has_cleanup: export_names.contains("cleanup"),
        has_timer_handler: export_names.contains("on_timer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(wat: &str) -> Module {
        Module::new(&Engine::default(), wat).unwrap()
    }

    #[test]
    fn reserved_and_prefixed_exports_are_normalized() {
        let module = module(
            r#"(module
                (memory (export "memory") 1)
                (func (export "alloc") (param i32) (result i32) i32.const 0)
                (func (export "constructor"))
                (func (export "on_timer") (param i32))
                (func (export "add") (param i32 i32) (result i32) i32.const 0)
                (func (export "json:greet") (param i32 i32) (result i64) i64.const 0)
                (func (export "greet") (result i32) i32.const 0))"#,
        );
        assert_eq!(callable_exports(&module), vec!["add", "greet"]);
    }

    #[test]
    fn fault_classification_finds_interrupts() {
        let err: wasmtime::Error = Interrupt::TimedOut { timeout_ms: 50 }.into();
        assert!(matches!(
            Fault::classify(&err, false),
            Fault::TimedOut { timeout_ms: 50 }
        ));
        let err = wasmtime::Error::from(Interrupt::Killed).context("while calling");
        assert!(matches!(Fault::classify(&err, false), Fault::Interrupted));
    }

    #[test]
    fn tripped_limiter_makes_any_fault_fatal() {
        let err = anyhow::anyhow!("wasm trap: out of bounds memory access");
        assert!(matches!(
            Fault::classify(&err, true),
            Fault::MemoryExhausted { .. }
        ));
        assert!(matches!(Fault::classify(&err, false), Fault::Trap { .. }));
    }

    #[test]
    fn limits_follow_config() {
        let config = SandboxConfig::default().with_max_timers(3);
        let limits = RuntimeLimits::from_config(&config);
        assert_eq!(limits.max_timers, 3);
        assert_eq!(limits.memory_limit_bytes, config.memory_limit_bytes);
    }

    #[test]
    fn bootstrap_survives_serialization() {
        let bootstrap = WorkerBootstrap {
            plugin_id: "demo".into(),
            plugin_path: PathBuf::from("/plugins/demo.wasm"),
            plugin_version: "1.0.0".into(),
            capabilities: CapabilityPolicy::parse(["crypto:access"]).unwrap(),
            environment: "test".into(),
            limits: RuntimeLimits::from_config(&SandboxConfig::default()),
        };
        let json = serde_json::to_string(&bootstrap).unwrap();
        let back: WorkerBootstrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bootstrap);
    }
}
