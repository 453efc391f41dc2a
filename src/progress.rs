//! # Progress Tracker
//! In-memory registry of per-article scoring progress, read by pollers.
//!
//! One entry per article id. Entries are created by [`ProgressTracker::start`],
//! advanced by the score manager and dropped either on acknowledgment
//! ([`ProgressTracker::remove`]) or by the sweeper once idle longer than the
//! configured TTL, whatever their status.
//!
//! Locking: a reader/writer lock over the map. Reads share it; every mutation
//! takes the write side for that mutation only. The sweep collects stale ids
//! under the read lock and then deletes them one write lock at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::metrics::{PROGRESS_ENTRIES, PROGRESS_SWEPT_TOTAL};

/// Default idle lifetime and sweep period.
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Queued,
    InProgress,
    Success,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Success | ProgressStatus::Error)
    }
}

/// Finer-grained phase within a status, for UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStep {
    Queued,
    Start,
    Calculating,
    Storing,
    Updating,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub article_id: i64,
    pub status: ProgressStatus,
    pub step: ProgressStep,
    /// 0..=100
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    pub last_touched: DateTime<Utc>,
}

impl ProgressState {
    fn queued(article_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            article_id,
            status: ProgressStatus::Queued,
            step: ProgressStep::Queued,
            percent: 0,
            message: "Queued for scoring".to_string(),
            error: None,
            final_score: None,
            last_touched: now,
        }
    }
}

/// Shared, lock-guarded progress registry. Construct once and hand out
/// `Arc<ProgressTracker>` clones.
#[derive(Debug)]
pub struct ProgressTracker {
    entries: RwLock<HashMap<i64, ProgressState>>,
    ttl: Duration,
    clock: SharedClock,
    sweeper_started: AtomicBool,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_TTL)
    }
}

impl ProgressTracker {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, clock::system())
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
            sweeper_started: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create or reset tracking for an article. Overwrites any existing
    /// entry so a re-analysis can restart tracking.
    pub fn start(&self, article_id: i64) -> ProgressState {
        let state = ProgressState::queued(article_id, self.clock.now());
        let len = {
            let mut map = self.entries.write();
            map.insert(article_id, state.clone());
            map.len()
        };
        gauge!(PROGRESS_ENTRIES).set(len as f64);
        debug!(article_id, "progress tracking started");
        state
    }

    /// Transition an existing entry. Returns `false` (and logs) when the
    /// article is not tracked; never an error.
    pub fn update(
        &self,
        article_id: i64,
        status: ProgressStatus,
        percent: u8,
        message: impl Into<String>,
    ) -> bool {
        let step = match status {
            ProgressStatus::Queued => ProgressStep::Queued,
            ProgressStatus::InProgress => ProgressStep::Start,
            ProgressStatus::Success => ProgressStep::Complete,
            ProgressStatus::Error => ProgressStep::Error,
        };
        self.advance(article_id, step, status, percent, message)
    }

    /// Like [`update`](Self::update) with an explicit step.
    pub fn advance(
        &self,
        article_id: i64,
        step: ProgressStep,
        status: ProgressStatus,
        percent: u8,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        self.mutate(article_id, |s| {
            s.step = step;
            s.status = status;
            s.percent = percent.min(100);
            s.message = message;
            if status != ProgressStatus::Error {
                s.error = None;
            }
        })
    }

    /// Terminal success with the persisted composite score.
    pub fn complete(&self, article_id: i64, final_score: f64) -> bool {
        self.mutate(article_id, |s| {
            s.step = ProgressStep::Complete;
            s.status = ProgressStatus::Success;
            s.percent = 100;
            s.message = "Scoring complete".to_string();
            s.error = None;
            s.final_score = Some(final_score);
        })
    }

    /// Terminal failure. Keeps the percent reached so far.
    pub fn fail(
        &self,
        article_id: i64,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> bool {
        let message = message.into();
        let error = error.into();
        self.mutate(article_id, |s| {
            s.step = ProgressStep::Error;
            s.status = ProgressStatus::Error;
            s.message = message;
            s.error = Some(error);
        })
    }

    fn mutate(&self, article_id: i64, f: impl FnOnce(&mut ProgressState)) -> bool {
        let now = self.clock.now();
        let found = {
            let mut map = self.entries.write();
            if let Some(state) = map.get_mut(&article_id) {
                f(state);
                state.last_touched = now;
                true
            } else {
                false
            }
        };
        if !found {
            warn!(article_id, "progress update for untracked article ignored");
        }
        found
    }

    pub fn get(&self, article_id: i64) -> Option<ProgressState> {
        self.entries.read().get(&article_id).cloned()
    }

    /// Explicit deletion, e.g. after a client acknowledged a terminal state.
    pub fn remove(&self, article_id: i64) -> Option<ProgressState> {
        let (removed, len) = {
            let mut map = self.entries.write();
            let removed = map.remove(&article_id);
            (removed, map.len())
        };
        gauge!(PROGRESS_ENTRIES).set(len as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn is_stale(&self, state: &ProgressState, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(state.last_touched);
        idle.to_std().map(|d| d > self.ttl).unwrap_or(false)
    }

    /// Drop every entry idle longer than the TTL. Returns how many went.
    pub fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let candidates: Vec<i64> = self
            .entries
            .read()
            .iter()
            .filter(|(_, s)| self.is_stale(s, now))
            .map(|(id, _)| *id)
            .collect();

        let mut removed = 0usize;
        for id in candidates {
            let mut map = self.entries.write();
            // Re-check: the entry may have been touched since the snapshot.
            if map.get(&id).is_some_and(|s| self.is_stale(s, now)) {
                map.remove(&id);
                removed += 1;
            }
        }

        if removed > 0 {
            counter!(PROGRESS_SWEPT_TOTAL).increment(removed as u64);
            info!(target: "progress", removed, "swept stale progress entries");
        }
        gauge!(PROGRESS_ENTRIES).set(self.len() as f64);
        removed
    }

    /// Spawn the periodic sweeper. Only the first call per tracker starts a
    /// task; later calls return `None`. The task stops on cancellation or
    /// once the tracker is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            warn!(target: "progress", "progress sweeper already running, not starting another");
            return None;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(tracker) = weak.upgrade() else {
                            debug!(target: "progress", "tracker dropped, sweeper exiting");
                            break;
                        };
                        tracker.sweep_stale();
                    }
                    _ = cancel.cancelled() => {
                        info!(target: "progress", "progress sweeper shutting down");
                        break;
                    }
                }
            }
        }))
    }
}
