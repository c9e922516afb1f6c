//! Per-session resource limits.
//!
//! - **[`MemoryLimiter`]** -- a [`wasmtime::ResourceLimiter`] that caps linear
//!   memory and table growth.  Growth past the ceiling is an error (the guest
//!   traps), and the limiter remembers that it tripped so the runtime can
//!   treat the fault as session-fatal.
//! - **[`TimerBudget`]** -- bounded count of outstanding timers.  Exceeding it
//!   is a hard error, never a silent drop.
//! - **[`TimerQueue`]** -- deadline-ordered timers owned by one worker, with
//!   every requested delay clamped to a maximum.
//!
//! All state lives in the worker's store, one instance per session.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Largest table (element count) a plugin may grow to.
pub const MAX_TABLE_ELEMENTS: usize = 10_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Limit violations raised from inside host calls; they surface to the guest
/// as traps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("memory limit exceeded: {requested} > {limit} bytes")]
    MemoryExceeded { requested: usize, limit: usize },

    #[error("table limit exceeded: {requested} > {limit} elements")]
    TableExceeded { requested: usize, limit: usize },

    #[error("timer limit exceeded: at most {max} timers may be pending")]
    TimerLimitExceeded { max: usize },
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Memory and table ceiling for one store.
///
/// The ceiling covers the sum of every linear memory in the store, so a
/// module declaring several memories shares one budget.
#[derive(Debug, Clone)]
pub struct MemoryLimiter {
    limit: usize,
    total: usize,
    peak: usize,
    exceeded: bool,
}

impl MemoryLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            total: 0,
            peak: 0,
            exceeded: false,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently granted across all memories.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Largest total linear-memory size granted so far.
    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Whether a growth request was ever refused.
    pub fn exceeded(&self) -> bool {
        self.exceeded
    }
}

impl wasmtime::ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        // Growth past the memory's own maximum fails in the engine without
        // being granted; it must not count against the session total.
        if maximum.is_some_and(|max| desired > max) {
            return Ok(false);
        }
        let requested = self
            .total
            .saturating_sub(current)
            .saturating_add(desired);
        if requested > self.limit {
            self.exceeded = true;
            tracing::warn!(current, desired, requested, limit = self.limit, "plugin memory growth refused");
            return Err(LimitError::MemoryExceeded {
                requested,
                limit: self.limit,
            }
            .into());
        }
        self.total = requested;
        self.peak = self.peak.max(requested);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > MAX_TABLE_ELEMENTS {
            return Err(LimitError::TableExceeded {
                requested: desired,
                limit: MAX_TABLE_ELEMENTS,
            }
            .into());
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Counter of outstanding timers bounded by a fixed maximum.
#[derive(Debug, Clone)]
pub struct TimerBudget {
    active: usize,
    max: usize,
}

impl TimerBudget {
    pub fn new(max: usize) -> Self {
        Self { active: 0, max }
    }

    /// Reserve one slot, failing once the maximum is reached.
    pub fn acquire(&mut self) -> Result<(), LimitError> {
        if self.active >= self.max {
            return Err(LimitError::TimerLimitExceeded { max: self.max });
        }
        self.active += 1;
        Ok(())
    }

    /// Release one slot (on fire or cancellation).
    pub fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A timer that is due and must be delivered to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub id: i32,
    pub token: i32,
}

/// Deadline-ordered timers for one session.
///
/// Cancellation removes a timer eagerly, so the queue never holds more
/// entries than the budget allows.
#[derive(Debug)]
pub struct TimerQueue {
    budget: TimerBudget,
    max_delay: Duration,
    next_id: i32,
    by_deadline: BTreeMap<(Instant, i32), i32>,
    deadlines: HashMap<i32, Instant>,
}

impl TimerQueue {
    pub fn new(max_timers: usize, max_delay: Duration) -> Self {
        Self {
            budget: TimerBudget::new(max_timers),
            max_delay,
            next_id: 1,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Clamp a guest-requested delay into `[0, max_delay]`.
    pub fn clamp_delay(&self, requested_ms: i64) -> Duration {
        let requested = Duration::from_millis(u64::try_from(requested_ms).unwrap_or(0));
        requested.min(self.max_delay)
    }

    /// Register a timer delivering `token` after `delay_ms`.  Returns the
    /// timer id.
    pub fn schedule(&mut self, delay_ms: i64, token: i32, now: Instant) -> Result<i32, LimitError> {
        self.budget.acquire()?;
        let id = self.allocate_id();
        let due = now + self.clamp_delay(delay_ms);
        self.by_deadline.insert((due, id), token);
        self.deadlines.insert(id, due);
        Ok(id)
    }

    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.deadlines.contains_key(&id) {
                return id;
            }
        }
    }

    /// Cancel a pending timer.  Returns whether it was still pending.
    pub fn cancel(&mut self, id: i32) -> bool {
        let Some(due) = self.deadlines.remove(&id) else {
            return false;
        };
        self.by_deadline.remove(&(due, id));
        self.budget.release();
        true
    }

    /// Deadline of the earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(due, _)| *due)
    }

    /// Remove every timer due at `now`, releasing its budget slot.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(entry) = self.by_deadline.first_entry() {
            let (at, id) = *entry.key();
            if at > now {
                break;
            }
            let token = entry.remove();
            self.deadlines.remove(&id);
            self.budget.release();
            due.push(DueTimer { id, token });
        }
        due
    }

    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }

    pub fn budget(&self) -> &TimerBudget {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use wasmtime::ResourceLimiter;

    use super::*;

    #[test]
    fn memory_within_limit_is_granted() {
        let mut limiter = MemoryLimiter::new(1024 * 1024);
        assert!(limiter.memory_growing(0, 65_536, None).unwrap());
        assert_eq!(limiter.peak(), 65_536);
        assert!(!limiter.exceeded());
    }

    #[test]
    fn memory_past_limit_errors_and_is_remembered() {
        let mut limiter = MemoryLimiter::new(65_536);
        let err = limiter.memory_growing(65_536, 131_072, None).unwrap_err();
        assert!(err.to_string().contains("memory limit exceeded"));
        assert!(limiter.exceeded());
    }

    #[test]
    fn ceiling_covers_all_memories_together() {
        let mut limiter = MemoryLimiter::new(2 * 65_536);
        // Two memories of one page each fill the budget.
        assert!(limiter.memory_growing(0, 65_536, None).unwrap());
        assert!(limiter.memory_growing(0, 65_536, None).unwrap());
        assert_eq!(limiter.total(), 2 * 65_536);
        // Growing either one by a page would exceed the shared ceiling.
        assert!(limiter.memory_growing(65_536, 2 * 65_536, None).is_err());
        assert!(limiter.exceeded());
        assert_eq!(limiter.total(), 2 * 65_536);
    }

    #[test]
    fn growth_past_declared_maximum_is_not_counted() {
        let mut limiter = MemoryLimiter::new(4 * 65_536);
        assert!(limiter.memory_growing(0, 65_536, Some(65_536)).unwrap());
        assert!(!limiter.memory_growing(65_536, 2 * 65_536, Some(65_536)).unwrap());
        assert_eq!(limiter.total(), 65_536);
        assert!(!limiter.exceeded());
    }

    #[test]
    fn table_growth_is_bounded() {
        let mut limiter = MemoryLimiter::new(1);
        assert!(limiter.table_growing(0, 10, None).unwrap());
        assert!(limiter.table_growing(0, MAX_TABLE_ELEMENTS + 1, None).is_err());
    }

    #[test]
    fn budget_rejects_past_maximum() {
        let mut budget = TimerBudget::new(2);
        budget.acquire().unwrap();
        budget.acquire().unwrap();
        assert_eq!(
            budget.acquire().unwrap_err(),
            LimitError::TimerLimitExceeded { max: 2 }
        );
        budget.release();
        assert!(budget.acquire().is_ok());
    }

    #[test]
    fn release_never_underflows() {
        let mut budget = TimerBudget::new(1);
        budget.release();
        assert_eq!(budget.active(), 0);
    }

    #[test]
    fn delays_are_clamped() {
        let queue = TimerQueue::new(10, Duration::from_secs(60));
        assert_eq!(queue.clamp_delay(-5), Duration::ZERO);
        assert_eq!(queue.clamp_delay(250), Duration::from_millis(250));
        assert_eq!(queue.clamp_delay(3_600_000), Duration::from_secs(60));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut queue = TimerQueue::new(10, Duration::from_secs(60));
        let now = Instant::now();
        let late = queue.schedule(200, 2, now).unwrap();
        let early = queue.schedule(100, 1, now).unwrap();
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(100)));

        let due = queue.take_due(now + Duration::from_millis(150));
        assert_eq!(due, vec![DueTimer { id: early, token: 1 }]);
        let due = queue.take_due(now + Duration::from_millis(250));
        assert_eq!(due, vec![DueTimer { id: late, token: 2 }]);
        assert_eq!(queue.budget().active(), 0);
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn schedule_fails_when_budget_exhausted() {
        let mut queue = TimerQueue::new(2, Duration::from_secs(60));
        let now = Instant::now();
        queue.schedule(10, 0, now).unwrap();
        queue.schedule(10, 0, now).unwrap();
        assert!(matches!(
            queue.schedule(10, 0, now),
            Err(LimitError::TimerLimitExceeded { max: 2 })
        ));
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn cancel_releases_budget_and_skips_entry() {
        let mut queue = TimerQueue::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let id = queue.schedule(10, 7, now).unwrap();
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert_eq!(queue.budget().active(), 0);
        assert!(queue.next_deadline().is_none());
        assert!(queue.take_due(now + Duration::from_secs(1)).is_empty());
        assert!(queue.schedule(10, 8, now).is_ok());
    }

    #[test]
    fn schedule_cancel_cycles_keep_the_queue_bounded() {
        let mut queue = TimerQueue::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let pinned = queue.schedule(60_000, 0, now);
        assert!(pinned.is_ok());
        assert!(queue.schedule(60_000, 1, now).is_err());
        queue.cancel(pinned.unwrap());

        for token in 0..100_000 {
            let id = queue.schedule(60_000, token, now).unwrap();
            assert!(queue.cancel(id));
        }
        assert_eq!(queue.pending(), 0);
        assert!(queue.by_deadline.is_empty());
        assert!(queue.deadlines.is_empty());
        assert_eq!(queue.budget().active(), 0);
    }

    #[test]
    fn timers_with_equal_deadlines_all_fire() {
        let mut queue = TimerQueue::new(3, Duration::from_secs(60));
        let now = Instant::now();
        let a = queue.schedule(10, 1, now).unwrap();
        let b = queue.schedule(10, 2, now).unwrap();
        let due = queue.take_due(now + Duration::from_millis(10));
        assert_eq!(
            due,
            vec![DueTimer { id: a, token: 1 }, DueTimer { id: b, token: 2 }]
        );
        assert_eq!(queue.pending(), 0);
    }
}
