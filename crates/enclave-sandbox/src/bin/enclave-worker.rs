//! Process-isolation worker.
//!
//! Spawned by the supervisor with a cleared environment.  Reads host
//! envelopes as frames on stdin, writes worker envelopes as frames on
//! stdout, and logs to stderr.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;
use enclave_sandbox::codec::{FrameSink, read_frame};
use enclave_sandbox::runtime::EnvelopeSink;
use enclave_sandbox::{WorkerBootstrap, run_worker};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "enclave-worker", version, about = "Enclave plugin worker process")]
struct Args {
    /// JSON-encoded worker bootstrap.
    #[arg(long)]
    bootstrap: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let bootstrap: WorkerBootstrap =
        serde_json::from_str(&args.bootstrap).context("invalid worker bootstrap")?;
    tracing::debug!(plugin_id = %bootstrap.plugin_id, "worker process starting");

    let (tx, inbox) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            loop {
                match read_frame(&mut stdin) {
                    Ok(Some(envelope)) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "unreadable frame from host");
                        break;
                    }
                }
            }
        })
        .context("failed to start stdin reader")?;

    let sink: Arc<dyn EnvelopeSink> = Arc::new(FrameSink::new(std::io::stdout()));
    run_worker(bootstrap, inbox, sink, Arc::new(AtomicBool::new(false)));
    Ok(())
}
