// Backlog - raw messages waiting for the search engine or directory to recover
//
// DESIGN: FIFO of the ORIGINAL raw lines (tenant prefix included), so a retry
// runs resolution and document building from scratch.
//
// Policy is explicit:
// - capacity: queued + in-flight entries never exceed it; new entries beyond
//   it are rejected and logged
// - max_attempts: an entry failing that many retries is discarded
//   (0 retries forever)
// - backoff: base * 2^(attempts-1), capped at max
//
// The lock is only held to push or to split off due entries, never across a
// retry, so ingestion does not wait on the drain task.

use crate::config::BacklogConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub raw: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub next_attempt_at: Instant,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BacklogConfig) -> Self {
        Self {
            capacity: config.capacity,
            max_attempts: config.max_attempts,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }

    /// Delay before the next retry, after `attempts` failed retries
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// What happened to an entry that failed its retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    Exhausted,
}

#[derive(Default)]
struct BacklogState {
    queue: VecDeque<BacklogEntry>,
    in_flight: usize,
}

pub struct Backlog {
    state: Mutex<BacklogState>,
    policy: RetryPolicy,
}

impl Backlog {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(BacklogState::default()),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a message for retry. Returns false when the backlog is full.
    pub fn push(&self, raw: String) -> bool {
        let mut state = self.lock();
        if state.queue.len() + state.in_flight >= self.policy.capacity {
            tracing::error!(
                capacity = self.policy.capacity,
                "backlog full, message discarded: {}",
                raw
            );
            return false;
        }

        state.queue.push_back(BacklogEntry {
            raw,
            enqueued_at: Utc::now(),
            attempts: 0,
            next_attempt_at: Instant::now(),
        });
        tracing::info!(backlog_len = state.queue.len(), "message added to backlog");
        true
    }

    /// Remove every entry due at `now`, keeping order. Entries not yet due
    /// stay queued. Taken entries count against capacity until settled.
    pub fn take_due(&self, now: Instant) -> Vec<BacklogEntry> {
        let mut state = self.lock();
        let (due, waiting): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.queue)
            .into_iter()
            .partition(|entry| entry.next_attempt_at <= now);
        state.queue = waiting;
        state.in_flight += due.len();
        Vec::from(due)
    }

    /// A taken entry was dispatched or dropped for good
    pub fn settle(&self, _entry: BacklogEntry) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// A taken entry failed again: back to the tail, or discarded once it
    /// has used up its attempts.
    pub fn requeue(&self, mut entry: BacklogEntry) -> RequeueOutcome {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        entry.attempts += 1;
        if self.policy.max_attempts > 0 && entry.attempts >= self.policy.max_attempts {
            tracing::error!(
                attempts = entry.attempts,
                enqueued_at = %entry.enqueued_at,
                "retry attempts exhausted, message discarded: {}",
                entry.raw
            );
            return RequeueOutcome::Exhausted;
        }

        entry.next_attempt_at = Instant::now() + self.policy.backoff(entry.attempts);
        state.queue.push_back(entry);
        RequeueOutcome::Requeued
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn contains(&self, raw: &str) -> bool {
        self.lock().queue.iter().any(|entry| entry.raw == raw)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BacklogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
