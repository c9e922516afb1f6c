//! Worker spawning and the host side of the message channel.
//!
//! - **Thread** -- the worker runs [`run_worker`] on a dedicated OS thread.
//!   Envelopes cross in-process channels and are never shared by reference.
//! - **Process** -- the worker is the `enclave-worker` binary, started with a
//!   cleared environment.  Envelopes cross its stdin/stdout as
//!   length-prefixed frames, pumped by two tokio tasks.
//!
//! Either way the supervisor sees the same [`WorkerLink`]: a sender, an
//! inbound receiver, and a [`WorkerHandle`] to reap or stop the worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{read_frame_async, write_frame_async};
use crate::config::{IsolationMode, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::protocol::Envelope;
use crate::runtime::{EnvelopeSink, WorkerBootstrap, run_worker};

/// File name of the process-isolation worker binary.
pub const WORKER_BINARY_NAME: &str = "enclave-worker";

/// How long a thread worker may take to notice the interrupt flag.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// Host-to-worker half of the channel.
#[derive(Debug)]
pub(crate) enum WorkerSender {
    Thread(std::sync::mpsc::Sender<Envelope>),
    Process(mpsc::UnboundedSender<Envelope>),
}

impl WorkerSender {
    /// Queue one envelope.  Returns `false` once the worker side is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self {
            Self::Thread(tx) => tx.send(envelope).is_ok(),
            Self::Process(tx) => tx.send(envelope).is_ok(),
        }
    }
}

/// Ownership of a running worker.
#[derive(Debug)]
pub(crate) enum WorkerHandle {
    Thread {
        exited: oneshot::Receiver<()>,
        interrupt: Arc<AtomicBool>,
        finished: bool,
    },
    Process {
        child: Child,
    },
}

impl WorkerHandle {
    /// Wait up to `grace` for the worker to exit on its own.
    pub async fn wait(&mut self, grace: Duration) -> bool {
        match self {
            Self::Thread {
                exited, finished, ..
            } => {
                if !*finished {
                    // A dropped sender means the thread is gone as well.
                    *finished = tokio::time::timeout(grace, exited).await.is_ok();
                }
                *finished
            }
            Self::Process { child } => matches!(
                tokio::time::timeout(grace, child.wait()).await,
                Ok(Ok(_))
            ),
        }
    }

    /// Stop the worker without its cooperation.
    pub async fn force_stop(&mut self) {
        if let Self::Process { child } = self {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill worker process");
            }
            return;
        }
        if let Self::Thread { interrupt, .. } = self {
            interrupt.store(true, Ordering::Relaxed);
        }
        if !self.wait(INTERRUPT_GRACE).await {
            tracing::error!("worker thread did not honour the interrupt flag, abandoning it");
        }
    }
}

/// Both directions of a freshly spawned worker.
pub(crate) struct WorkerLink {
    pub sender: WorkerSender,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub handle: WorkerHandle,
}

/// Spawn a worker for `bootstrap` in the configured isolation mode.
pub(crate) fn spawn_worker(bootstrap: WorkerBootstrap, config: &SandboxConfig) -> Result<WorkerLink> {
    match config.isolation {
        IsolationMode::Thread => spawn_thread(bootstrap),
        IsolationMode::Process => spawn_process(bootstrap, config),
    }
}

fn spawn_thread(bootstrap: WorkerBootstrap) -> Result<WorkerLink> {
    let (to_worker, inbox) = std::sync::mpsc::channel();
    let (from_worker, inbound) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let interrupt = Arc::new(AtomicBool::new(false));
    let worker_interrupt = Arc::clone(&interrupt);

    std::thread::Builder::new()
        .name(format!("enclave-{}", bootstrap.plugin_id))
        .spawn(move || {
            let sink: Arc<dyn EnvelopeSink> = Arc::new(from_worker);
            run_worker(bootstrap, inbox, sink, worker_interrupt);
            let _ = exit_tx.send(());
        })
        .map_err(|e| SandboxError::Spawn(format!("failed to start worker thread: {e}")))?;

    Ok(WorkerLink {
        sender: WorkerSender::Thread(to_worker),
        inbound,
        handle: WorkerHandle::Thread {
            exited: exit_rx,
            interrupt,
            finished: false,
        },
    })
}

/// Locate the worker binary: the configured path, else next to the current
/// executable.
pub fn resolve_worker_binary(config: &SandboxConfig) -> Result<PathBuf> {
    if let Some(path) = &config.worker_binary {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| SandboxError::Spawn("current executable has no parent directory".into()))?;
    // Test binaries live one level below the build directory.
    let name = format!("{WORKER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX);
    [dir.join(&name), dir.join("..").join(&name)]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            SandboxError::Spawn(format!(
                "{name} not found next to {}; set `worker_binary` in the sandbox config",
                exe.display()
            ))
        })
}

fn spawn_process(bootstrap: WorkerBootstrap, config: &SandboxConfig) -> Result<WorkerLink> {
    let binary = resolve_worker_binary(config)?;
    let encoded = serde_json::to_string(&bootstrap)
        .map_err(|e| SandboxError::Spawn(format!("failed to encode worker bootstrap: {e}")))?;

    let mut command = Command::new(&binary);
    command
        .arg("--bootstrap")
        .arg(encoded)
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Ok(filter) = std::env::var("RUST_LOG") {
        command.env("RUST_LOG", filter);
    }

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Spawn(format!("failed to start {}: {e}", binary.display())))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Spawn("worker stdin was not captured".into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Spawn("worker stdout was not captured".into()))?;

    tracing::debug!(
        plugin_id = %bootstrap.plugin_id,
        pid = ?child.id(),
        binary = %binary.display(),
        "worker process started"
    );

    let (to_worker, mut outbound) = mpsc::unbounded_channel::<Envelope>();
    let (from_worker, inbound) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            if let Err(e) = write_frame_async(&mut stdin, &envelope).await {
                tracing::debug!(error = %e, "worker stdin closed");
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_frame_async(&mut stdout).await {
                Ok(Some(envelope)) => {
                    if from_worker.send(envelope).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable frame from worker, closing channel");
                    break;
                }
            }
        }
    });

    Ok(WorkerLink {
        sender: WorkerSender::Process(to_worker),
        inbound,
        handle: WorkerHandle::Process { child },
    })
}
