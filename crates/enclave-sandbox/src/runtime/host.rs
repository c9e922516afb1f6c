//! Per-store host state and execution deadlines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use wasmtime::{AsContext, AsContextMut, Memory, StoreContextMut, UpdateDeadline};

use crate::limiter::{MemoryLimiter, TimerQueue};
use crate::protocol::Envelope;
use crate::sanitize::LogSanitizer;

use super::EnvelopeSink;

/// Largest single buffer a host function will copy out of guest memory.
pub(crate) const MAX_GUEST_BUFFER: usize = 16 * 1024 * 1024;

/// Allow-listed values a plugin may read through `env.process_info`.
#[derive(Debug, Clone)]
pub(crate) struct ProcessInfo {
    pub environment: String,
    pub plugin_id: String,
    pub plugin_version: String,
}

impl ProcessInfo {
    pub const KEYS: [&'static str; 3] = ["SANDBOX_ENV", "PLUGIN_ID", "PLUGIN_VERSION"];

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "SANDBOX_ENV" => Some(&self.environment),
            "PLUGIN_ID" => Some(&self.plugin_id),
            "PLUGIN_VERSION" => Some(&self.plugin_version),
            _ => None,
        }
    }
}

/// Why a running guest was stopped by the epoch callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum Interrupt {
    #[error("execution timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("execution interrupted by the host")]
    Killed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveDeadline {
    pub at: Instant,
    pub timeout_ms: u64,
}

/// Data owned by the wasm store: everything host imports may touch.
pub(crate) struct HostState {
    pub process_info: ProcessInfo,
    pub limiter: MemoryLimiter,
    pub timers: TimerQueue,
    pub sanitizer: LogSanitizer,
    pub sink: Arc<dyn EnvelopeSink>,
    pub deadline: Option<ActiveDeadline>,
    pub interrupt: Arc<AtomicBool>,
}

impl HostState {
    /// Arm the deadline for the next guest entry.  A timeout too large to
    /// represent leaves the guest without a deadline.
    pub fn arm(&mut self, timeout: Duration) {
        self.deadline = Instant::now()
            .checked_add(timeout)
            .map(|at| ActiveDeadline {
                at,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn send(&self, envelope: Envelope) {
        if !self.sink.send(envelope) {
            tracing::debug!(plugin_id = %self.process_info.plugin_id, "host channel closed, envelope dropped");
        }
    }
}

/// Epoch callback installed on every store: runs once per tick while guest
/// code executes.
pub(crate) fn check_deadline(
    ctx: StoreContextMut<'_, HostState>,
) -> wasmtime::Result<UpdateDeadline> {
    let state = ctx.data();
    if state.interrupt.load(Ordering::Relaxed) {
        return Err(Interrupt::Killed.into());
    }
    if let Some(deadline) = state.deadline {
        if Instant::now() >= deadline.at {
            return Err(Interrupt::TimedOut {
                timeout_ms: deadline.timeout_ms,
            }
            .into());
        }
    }
    Ok(UpdateDeadline::Continue(1))
}

// ---------------------------------------------------------------------------
// Guest memory access
// ---------------------------------------------------------------------------

/// Wasm32 pointers and lengths are unsigned; reinterpret the `i32` bits.
pub(crate) fn guest_usize(raw: i32) -> usize {
    raw as u32 as usize
}

pub(crate) fn read_guest(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> wasmtime::Result<Vec<u8>> {
    let len = guest_usize(len);
    if len > MAX_GUEST_BUFFER {
        anyhow::bail!("guest buffer of {len} bytes exceeds the {MAX_GUEST_BUFFER} byte limit");
    }
    let mut buf = vec![0u8; len];
    memory
        .read(store, guest_usize(ptr), &mut buf)
        .map_err(|e| anyhow::anyhow!("guest read out of bounds: {e}"))?;
    Ok(buf)
}

pub(crate) fn write_guest(
    memory: &Memory,
    store: impl AsContextMut,
    ptr: i32,
    bytes: &[u8],
) -> wasmtime::Result<()> {
    memory
        .write(store, guest_usize(ptr), bytes)
        .map_err(|e| anyhow::anyhow!("guest write out of bounds: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ProcessInfo {
        ProcessInfo {
            environment: "test".into(),
            plugin_id: "demo".into(),
            plugin_version: "1.2.3".into(),
        }
    }

    #[test]
    fn process_info_exposes_only_allow_listed_keys() {
        let info = info();
        assert_eq!(info.get("PLUGIN_ID"), Some("demo"));
        assert_eq!(info.get("PLUGIN_VERSION"), Some("1.2.3"));
        assert_eq!(info.get("SANDBOX_ENV"), Some("test"));
        assert_eq!(info.get("HOME"), None);
        assert_eq!(info.get("PATH"), None);
        assert_eq!(info.get("plugin_id"), None);
    }

    #[test]
    fn every_allow_listed_key_resolves() {
        let info = info();
        for key in ProcessInfo::KEYS {
            assert!(info.get(key).is_some(), "{key} should resolve");
        }
    }

    fn state() -> HostState {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<Envelope>();
        HostState {
            process_info: info(),
            limiter: MemoryLimiter::new(65_536),
            timers: TimerQueue::new(1, Duration::from_secs(1)),
            sanitizer: LogSanitizer::new(4),
            sink: Arc::new(tx),
            deadline: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn arming_records_the_timeout() {
        let mut state = state();
        state.arm(Duration::from_millis(250));
        let deadline = state.deadline.unwrap();
        assert_eq!(deadline.timeout_ms, 250);
        assert!(deadline.at > Instant::now());
        state.disarm();
        assert!(state.deadline.is_none());
    }

    #[test]
    fn unrepresentable_timeout_arms_no_deadline() {
        let mut state = state();
        state.arm(Duration::MAX);
        assert!(state.deadline.is_none());
    }

    #[test]
    fn negative_pointers_are_high_addresses() {
        assert_eq!(guest_usize(-1), u32::MAX as usize);
        assert_eq!(guest_usize(1024), 1024);
    }
}
