//! In-process extraction task queue.
//!
//! The queue is the only concurrency-control point of the pipeline. It holds
//! at most one task per document and enforces:
//!
//! - a dispatch rate ceiling (`governor`, tasks per second),
//! - a concurrency ceiling on outstanding leases,
//! - leases that expire after `lease_timeout`, making the task
//!   re-dispatchable (at-least-once delivery),
//! - capped exponential backoff bounded by `max_attempts` and
//!   `max_retry_duration` measured from first enqueue.
//!
//! Every `ack`/`fail` is fenced by the lease it was dispatched with, so a run
//! whose lease expired cannot settle a task that was redelivered since.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use underwrite_core::{Error, ExtractionFailure, MethodPreference, QueueConfig, Result};

use crate::backoff::BackoffPolicy;

type DispatchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Unit of scheduled extraction work for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionTask {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Dispatches so far, including the one currently leased.
    pub attempt_count: u32,
    pub method_hint: Option<MethodPreference>,
    pub scheduled_at: Instant,
    pub first_enqueued_at: Instant,
    pub last_error: Option<String>,
}

/// Time-bounded ownership of a dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub lease_id: Uuid,
    pub task_id: Uuid,
    pub document_id: Uuid,
    /// 1-based attempt number of this dispatch.
    pub attempt: u32,
    pub method_hint: Option<MethodPreference>,
    /// Expiry as of dispatch; `renew` moves the live expiry, not this copy.
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub task_id: Uuid,
    /// `false` when the document already had a task.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Leased(Lease),
    /// Nothing is due. `next_due` is the wait until the earliest delayed
    /// task or live lease expiry, `None` when the queue is empty.
    Idle { next_due: Option<Duration> },
    /// The concurrency ceiling is reached.
    Saturated { next_expiry: Option<Duration> },
    /// A task is due but the rate budget is spent.
    RateLimited { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Rescheduled; `attempt` is the number the next dispatch will carry.
    Retrying { attempt: u32, delay: Duration },
    /// Non-retryable failure; the task is gone.
    Dropped,
    /// Retry budget spent; the task is gone.
    Exhausted(ExtractionFailure),
}

/// A lease that expired without `ack`/`fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reaped {
    pub document_id: Uuid,
    pub task_id: Uuid,
    pub attempt: u32,
    /// Set when the task was dropped instead of made re-dispatchable.
    pub exhausted: Option<ExtractionFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Due and waiting for dispatch.
    pub ready: usize,
    /// Waiting out a retry backoff.
    pub delayed: usize,
    pub leased: usize,
    pub max_concurrent: usize,
}

struct ActiveLease {
    lease_id: Uuid,
    expires_at: Instant,
}

struct TaskEntry {
    task: ExtractionTask,
    seq: u64,
    lease: Option<ActiveLease>,
}

#[derive(Default)]
struct QueueState {
    /// Keyed by document id: one task per document.
    tasks: HashMap<Uuid, TaskEntry>,
    seq: u64,
    reaped: Vec<Reaped>,
}

pub struct TaskQueue {
    config: QueueConfig,
    backoff: BackoffPolicy,
    state: Mutex<QueueState>,
    limiter: DispatchLimiter,
    clock: DefaultClock,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let rate = NonZeroU32::new(config.dispatch_rate)
            .ok_or_else(|| Error::Config("dispatch_rate must be positive".to_string()))?;
        Ok(Self {
            backoff: BackoffPolicy::from_config(&config),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            clock: DefaultClock::default(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a task for `document_id`, or return the one it already has.
    pub async fn enqueue(
        &self,
        document_id: Uuid,
        method_hint: Option<MethodPreference>,
    ) -> Enqueued {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tasks.get(&document_id) {
            return Enqueued {
                task_id: entry.task.id,
                created: false,
            };
        }

        state.seq += 1;
        let seq = state.seq;
        let task = ExtractionTask {
            id: Uuid::now_v7(),
            document_id,
            attempt_count: 0,
            method_hint,
            scheduled_at: now,
            first_enqueued_at: now,
            last_error: None,
        };
        let task_id = task.id;
        state.tasks.insert(
            document_id,
            TaskEntry {
                task,
                seq,
                lease: None,
            },
        );
        drop(state);

        debug!(
            subsystem = "jobs",
            component = "queue",
            document_id = %document_id,
            task_id = %task_id,
            "Task enqueued"
        );
        self.notify.notify_waiters();
        Enqueued {
            task_id,
            created: true,
        }
    }

    /// Lease the next due task if the concurrency and rate budgets allow.
    pub async fn try_dispatch(&self) -> DispatchOutcome {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state, now);

        let leased = state.tasks.values().filter(|e| e.lease.is_some()).count();
        if leased >= self.config.max_concurrent {
            let next_expiry = state
                .tasks
                .values()
                .filter_map(|e| e.lease.as_ref())
                .map(|l| l.expires_at.saturating_duration_since(now))
                .min();
            return DispatchOutcome::Saturated { next_expiry };
        }

        let ready = state
            .tasks
            .iter()
            .filter(|(_, e)| e.lease.is_none() && e.task.scheduled_at <= now)
            .min_by_key(|(_, e)| (e.task.scheduled_at, e.seq))
            .map(|(document_id, _)| *document_id);

        let Some(document_id) = ready else {
            // A leased task comes due again when its lease runs out.
            let next_due = state
                .tasks
                .values()
                .map(|e| match &e.lease {
                    Some(lease) => lease.expires_at,
                    None => e.task.scheduled_at,
                })
                .map(|at| at.saturating_duration_since(now))
                .min();
            return DispatchOutcome::Idle { next_due };
        };

        if let Err(not_until) = self.limiter.check() {
            return DispatchOutcome::RateLimited {
                retry_after: not_until.wait_time_from(self.clock.now()),
            };
        }

        let Some(entry) = state.tasks.get_mut(&document_id) else {
            return DispatchOutcome::Idle { next_due: None };
        };
        entry.task.attempt_count += 1;
        let active = ActiveLease {
            lease_id: Uuid::new_v4(),
            expires_at: now + self.config.lease_timeout,
        };
        let lease = Lease {
            lease_id: active.lease_id,
            task_id: entry.task.id,
            document_id,
            attempt: entry.task.attempt_count,
            method_hint: entry.task.method_hint,
            expires_at: active.expires_at,
        };
        entry.lease = Some(active);

        debug!(
            subsystem = "jobs",
            component = "queue",
            document_id = %document_id,
            task_id = %lease.task_id,
            attempt = lease.attempt,
            "Task dispatched"
        );
        DispatchOutcome::Leased(lease)
    }

    /// Wait until a task can be leased.
    pub async fn dispatch(&self) -> Lease {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = match self.try_dispatch().await {
                DispatchOutcome::Leased(lease) => return lease,
                DispatchOutcome::Idle { next_due } => next_due,
                DispatchOutcome::Saturated { next_expiry } => next_expiry,
                DispatchOutcome::RateLimited { retry_after } => Some(retry_after),
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Settle a successful run and remove its task.
    pub async fn ack(&self, lease: &Lease) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if !Self::holds_locked(&state, lease, now) {
            return Err(Self::stale(lease));
        }
        state.tasks.remove(&lease.document_id);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Settle a failed run: reschedule, drop or exhaust the task.
    pub async fn fail(&self, lease: &Lease, failure: &ExtractionFailure) -> Result<FailOutcome> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if !Self::holds_locked(&state, lease, now) {
            return Err(Self::stale(lease));
        }

        let outcome = if !failure.is_retryable() {
            state.tasks.remove(&lease.document_id);
            FailOutcome::Dropped
        } else {
            let entry = state
                .tasks
                .get_mut(&lease.document_id)
                .ok_or_else(|| Self::stale(lease))?;
            let attempts = entry.task.attempt_count;
            let delay = self.backoff.delay(attempts);
            let deadline = entry.task.first_enqueued_at + self.config.max_retry_duration;

            if attempts >= self.config.max_attempts || now + delay > deadline {
                state.tasks.remove(&lease.document_id);
                FailOutcome::Exhausted(ExtractionFailure::AttemptsExhausted {
                    attempts,
                    last_error: failure.to_string(),
                })
            } else {
                entry.lease = None;
                entry.task.scheduled_at = now + delay;
                entry.task.last_error = Some(failure.to_string());
                FailOutcome::Retrying {
                    attempt: attempts + 1,
                    delay,
                }
            }
        };
        drop(state);

        match &outcome {
            FailOutcome::Retrying { attempt, delay } => debug!(
                subsystem = "jobs",
                component = "queue",
                document_id = %lease.document_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retry scheduled"
            ),
            FailOutcome::Exhausted(e) => warn!(
                subsystem = "jobs",
                component = "queue",
                document_id = %lease.document_id,
                error = %e,
                "Retry budget exhausted"
            ),
            FailOutcome::Dropped => debug!(
                subsystem = "jobs",
                component = "queue",
                document_id = %lease.document_id,
                "Task dropped after non-retryable failure"
            ),
        }
        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Whether `lease` is still the live lease of its task.
    pub async fn holds(&self, lease: &Lease) -> bool {
        let state = self.state.lock().await;
        Self::holds_locked(&state, lease, Instant::now())
    }

    /// Push the expiry of a live lease out by another `lease_timeout`.
    ///
    /// Fails once the lease has expired or the task was settled; an expired
    /// lease is never revived.
    pub async fn renew(&self, lease: &Lease) -> Result<Instant> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if !Self::holds_locked(&state, lease, now) {
            return Err(Self::stale(lease));
        }
        let expires_at = now + self.config.lease_timeout;
        if let Some(active) = state
            .tasks
            .get_mut(&lease.document_id)
            .and_then(|e| e.lease.as_mut())
        {
            active.expires_at = expires_at;
        }
        debug!(
            subsystem = "jobs",
            component = "queue",
            document_id = %lease.document_id,
            attempt = lease.attempt,
            "Lease renewed"
        );
        Ok(expires_at)
    }

    /// Expire overdue leases, returning everything reaped since the last call.
    pub async fn reap_expired(&self) -> Vec<Reaped> {
        let mut state = self.state.lock().await;
        self.reap_locked(&mut state, Instant::now());
        let reaped = std::mem::take(&mut state.reaped);
        drop(state);
        if !reaped.is_empty() {
            self.notify.notify_waiters();
        }
        reaped
    }

    pub async fn task(&self, document_id: Uuid) -> Option<ExtractionTask> {
        let state = self.state.lock().await;
        state.tasks.get(&document_id).map(|e| e.task.clone())
    }

    pub async fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            max_concurrent: self.config.max_concurrent,
            ..QueueStats::default()
        };
        for entry in state.tasks.values() {
            match &entry.lease {
                Some(lease) if lease.expires_at > now => stats.leased += 1,
                _ if entry.task.scheduled_at > now => stats.delayed += 1,
                _ => stats.ready += 1,
            }
        }
        stats
    }

    fn holds_locked(state: &QueueState, lease: &Lease, now: Instant) -> bool {
        state
            .tasks
            .get(&lease.document_id)
            .filter(|e| e.task.id == lease.task_id)
            .and_then(|e| e.lease.as_ref())
            .is_some_and(|l| l.lease_id == lease.lease_id && l.expires_at > now)
    }

    fn stale(lease: &Lease) -> Error {
        Error::Queue(format!(
            "lease {} on document {} is no longer held",
            lease.lease_id, lease.document_id
        ))
    }

    fn reap_locked(&self, state: &mut QueueState, now: Instant) {
        let expired: Vec<Uuid> = state
            .tasks
            .iter()
            .filter(|(_, e)| e.lease.as_ref().is_some_and(|l| l.expires_at <= now))
            .map(|(document_id, _)| *document_id)
            .collect();

        for document_id in expired {
            let Some(entry) = state.tasks.get_mut(&document_id) else {
                continue;
            };
            entry.lease = None;
            let attempts = entry.task.attempt_count;
            let out_of_time = now >= entry.task.first_enqueued_at + self.config.max_retry_duration;
            let exhausted = (attempts >= self.config.max_attempts || out_of_time).then(|| {
                ExtractionFailure::AttemptsExhausted {
                    attempts,
                    last_error: entry
                        .task
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "lease expired without acknowledgement".to_string()),
                }
            });
            let reaped = Reaped {
                document_id,
                task_id: entry.task.id,
                attempt: attempts,
                exhausted,
            };
            if reaped.exhausted.is_some() {
                state.tasks.remove(&document_id);
            }

            warn!(
                subsystem = "jobs",
                component = "queue",
                document_id = %document_id,
                attempt = attempts,
                exhausted = reaped.exhausted.is_some(),
                "Lease expired"
            );
            state.reaped.push(reaped);
        }
    }
}
