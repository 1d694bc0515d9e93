//! Hybrid task scheduler.
//!
//! The scheduler owns a registry of [`Task`] records tagged by the
//! [`Domain`] that submitted them and decides which single task receives
//! the next execution slot.  It never runs anything itself: the host calls
//! [`HybridScheduler::get_next_task`], executes the task, and reports back
//! through [`HybridScheduler::update_task_state`].
//!
//! # Selection policy
//!
//! 1. Only `Ready` tasks are eligible.
//! 2. A ready `Native` task always preempts guest work.
//! 3. Otherwise a weighted coin picks the favored guest domain: `GuestA`
//!    with probability `guest_ratio`, `GuestB` with `1 - guest_ratio`.  When
//!    the favored domain has nothing ready the other guest domain is used.
//! 4. Inside a domain the highest priority wins; ties go to the task that
//!    has waited longest (earliest `last_scheduled`), then to the lowest id.
//!
//! Fairness between the guest domains is statistical, not per call.  The
//! ratio is kept inside `[MIN_GUEST_SHARE, MAX_GUEST_SHARE]` so neither guest
//! can be starved of selection weight.
//!
//! # Task lifecycle
//!
//! ```text
//! Ready  <-->  Running  -->  Terminated
//!    \          /
//!     Blocked --
//! ```
//!
//! `Terminated` is absorbing.  Terminated tasks stay in the registry for
//! diagnostics until the host calls [`HybridScheduler::purge_terminated`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::ipc::{Event, IpcBus};

/// Lower bound of either guest domain's selection weight and CPU quota.
pub const MIN_GUEST_SHARE: f64 = 0.3;
/// Upper bound of either guest domain's selection weight and CPU quota.
pub const MAX_GUEST_SHARE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique, time-ordered task identifier (UUID v7).
pub type TaskId = Uuid;

/// The logical OS domain that owns a task or module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// The host's own kernel work.  Never subject to the fairness split.
    #[serde(alias = "chimera")]
    Native,
    /// First guest OS ("windows").
    #[serde(alias = "windows")]
    GuestA,
    /// Second guest OS ("linux").
    #[serde(alias = "linux")]
    GuestB,
}

impl Domain {
    fn index(self) -> usize {
        match self {
            Self::Native => 0,
            Self::GuestA => 1,
            Self::GuestB => 2,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::GuestA => write!(f, "guest_a"),
            Self::GuestB => write!(f, "guest_b"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Eligible for selection.
    Ready,
    /// Handed to the host for execution.
    Running,
    /// Waiting on something external.
    Blocked,
    /// Finished.  No further transitions are accepted.
    Terminated,
}

impl TaskState {
    /// Whether `self -> next` is part of the task state machine.
    ///
    /// Only consulted when strict transitions are enabled.  Self-transitions
    /// are always allowed for non-terminated states.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Terminated, _) => false,
            (a, b) if a == b => true,
            (Ready, Running | Blocked | Terminated) => true,
            (Running, Ready | Blocked | Terminated) => true,
            (Blocked, Ready | Terminated) => true,
            _ => false,
        }
    }
}

/// Registration payload: a task without its registry-assigned fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub domain: Domain,
    /// Expected in `0..=100`; not validated.
    pub priority: i32,
    pub cpu_affinity: Option<BTreeSet<u16>>,
    /// Resident memory in bytes.
    pub memory_usage: u64,
    pub state: TaskState,
    pub quantum_ms: Option<u64>,
}

impl NewTask {
    /// A `Ready` task with no affinity, no memory footprint and no quantum.
    pub fn new(name: impl Into<String>, domain: Domain, priority: i32) -> Self {
        Self {
            name: name.into(),
            domain,
            priority,
            cpu_affinity: None,
            memory_usage: 0,
            state: TaskState::Ready,
            quantum_ms: None,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_affinity(mut self, cores: impl IntoIterator<Item = u16>) -> Self {
        self.cpu_affinity = Some(cores.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_memory_usage(mut self, bytes: u64) -> Self {
        self.memory_usage = bytes;
        self
    }

    #[must_use]
    pub fn with_quantum_ms(mut self, quantum_ms: u64) -> Self {
        self.quantum_ms = Some(quantum_ms);
        self
    }
}

/// A task record as held by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub domain: Domain,
    pub priority: i32,
    pub cpu_affinity: Option<BTreeSet<u16>>,
    pub memory_usage: u64,
    /// Registration time, refreshed each time the task enters `Running`.
    pub last_scheduled: DateTime<Utc>,
    pub state: TaskState,
    pub quantum_ms: Option<u64>,
}

/// Two-party CPU split returned by [`HybridScheduler::allocate_cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuAllocation {
    pub guest_a_quota: f64,
    pub guest_b_quota: f64,
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub native_selections: u64,
    pub guest_a_selections: u64,
    pub guest_b_selections: u64,
    /// Selections served by the non-favored guest domain.
    pub fallbacks: u64,
    /// Calls that found no ready task.
    pub empty_polls: u64,
    pub ratio_adjustments: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority- and domain-aware task selector.
///
/// Cheaply cloneable (`Arc`-backed).  All clones share the same registry,
/// ratio and random source.
#[derive(Clone)]
pub struct HybridScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tasks: DashMap<TaskId, Task>,

    /// Current guest ratio stored as `f64` bits.
    guest_ratio: AtomicU64,

    /// Source for the domain coin-flip.
    rng: Mutex<StdRng>,

    config: SchedulerConfig,

    counters: Counters,

    bus: Option<IpcBus>,
}

#[derive(Default)]
struct Counters {
    selections: [AtomicU64; 3],
    fallbacks: AtomicU64,
    empty_polls: AtomicU64,
    ratio_adjustments: AtomicU64,
}

impl HybridScheduler {
    /// Create a scheduler with default settings and no event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), None)
    }

    /// Create a scheduler from explicit settings, optionally publishing
    /// events on `bus`.
    #[must_use]
    pub fn with_config(config: SchedulerConfig, bus: Option<IpcBus>) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let ratio = clamp_share(config.initial_ratio).unwrap_or(0.5);

        Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                guest_ratio: AtomicU64::new(ratio.to_bits()),
                rng: Mutex::new(rng),
                config,
                counters: Counters::default(),
                bus,
            }),
        }
    }

    /// Add a task to the registry and return its freshly assigned id.
    ///
    /// `last_scheduled` is set to the registration time.  Priority is stored
    /// as given.
    pub fn register_task(&self, new_task: NewTask) -> TaskId {
        let now = Utc::now();
        let quantum_ms = new_task.quantum_ms.or(self.inner.config.default_quantum_ms);

        let id = loop {
            let candidate = Uuid::now_v7();
            match self.inner.tasks.entry(candidate) {
                Entry::Occupied(_) => {
                    tracing::warn!(task_id = %candidate, "task id collision, retrying");
                }
                Entry::Vacant(slot) => {
                    slot.insert(Task {
                        id: candidate,
                        name: new_task.name.clone(),
                        domain: new_task.domain,
                        priority: new_task.priority,
                        cpu_affinity: new_task.cpu_affinity.clone(),
                        memory_usage: new_task.memory_usage,
                        last_scheduled: now,
                        state: new_task.state,
                        quantum_ms,
                    });
                    break candidate;
                }
            }
        };

        tracing::debug!(
            task_id = %id,
            task_name = %new_task.name,
            domain = %new_task.domain,
            priority = new_task.priority,
            "task registered"
        );

        self.publish(Event::TaskRegistered {
            task_id: id,
            task_name: new_task.name,
            domain: new_task.domain,
            timestamp: now,
        });

        id
    }

    /// Pick the task that should receive the next execution slot.
    ///
    /// Does not change any task state: the caller marks the returned task
    /// `Running` via [`update_task_state`](Self::update_task_state).
    pub fn get_next_task(&self) -> Option<Task> {
        let mut best: [Option<SelectionKey>; 3] = [None, None, None];

        for entry in self.inner.tasks.iter() {
            let task = entry.value();
            if task.state != TaskState::Ready {
                continue;
            }
            let key = SelectionKey::of(task);
            let slot = &mut best[task.domain.index()];
            if slot.as_ref().is_none_or(|current| key < *current) {
                *slot = Some(key);
            }
        }

        let [native, guest_a, guest_b] = best;

        let (winner, fallback) = if let Some(key) = native {
            (key, false)
        } else if guest_a.is_none() && guest_b.is_none() {
            self.inner.counters.empty_polls.fetch_add(1, AtomicOrdering::Relaxed);
            return None;
        } else {
            let (favored, other) = if self.flip_for_guest_a() {
                (guest_a, guest_b)
            } else {
                (guest_b, guest_a)
            };
            match favored {
                Some(key) => (key, false),
                None => (other?, true),
            }
        };

        // Only the winner is cloned out of the registry.
        let task = self.task(winner.id)?;
        self.record_selection(&task, fallback);
        Some(task)
    }

    /// Move a task to `new_state`.
    ///
    /// Returns `false` when the id is unknown, the task is already
    /// terminated, or strict transitions are enabled and the move is not
    /// part of the state machine.  Entering `Running` refreshes
    /// `last_scheduled`.
    pub fn update_task_state(&self, task_id: TaskId, new_state: TaskState) -> bool {
        let Some(mut entry) = self.inner.tasks.get_mut(&task_id) else {
            tracing::debug!(task_id = %task_id, "state update for unknown task");
            return false;
        };

        let old_state = entry.state;
        if old_state == TaskState::Terminated {
            tracing::debug!(task_id = %task_id, requested = ?new_state, "task already terminated");
            return false;
        }
        if self.inner.config.strict_transitions && !old_state.can_transition_to(new_state) {
            tracing::warn!(
                task_id = %task_id,
                from = ?old_state,
                to = ?new_state,
                "rejected task state transition"
            );
            return false;
        }

        let now = Utc::now();
        entry.state = new_state;
        if new_state == TaskState::Running {
            entry.last_scheduled = now;
        }
        drop(entry);

        tracing::trace!(task_id = %task_id, from = ?old_state, to = ?new_state, "task state changed");

        self.publish(Event::TaskStateChanged {
            task_id,
            old_state,
            new_state,
            timestamp: now,
        });

        true
    }

    /// Set or recompute the guest ratio and return the value now in effect.
    ///
    /// With `Some(ratio)` the value is clamped into the fairness band and
    /// adopted.  With `None` the ratio becomes the share of guest A in the
    /// summed priority of all non-terminated guest tasks (negative
    /// priorities count as zero); when both sums are zero the ratio is left
    /// unchanged.
    pub fn adjust_os_ratio(&self, new_ratio: Option<f64>) -> f64 {
        let old_ratio = self.guest_ratio();

        let target = match new_ratio {
            Some(requested) => match clamp_share(requested) {
                Some(ratio) => ratio,
                None => {
                    tracing::warn!(requested, "ignoring non-finite guest ratio");
                    return old_ratio;
                }
            },
            None => {
                let (weight_a, weight_b) = self.guest_weights();
                let total = weight_a + weight_b;
                if total == 0 {
                    tracing::debug!("no guest load, guest ratio unchanged");
                    return old_ratio;
                }
                let share = weight_a as f64 / total as f64;
                share.clamp(MIN_GUEST_SHARE, MAX_GUEST_SHARE)
            }
        };

        self.inner
            .guest_ratio
            .store(target.to_bits(), AtomicOrdering::Release);
        self.inner
            .counters
            .ratio_adjustments
            .fetch_add(1, AtomicOrdering::Relaxed);

        tracing::debug!(old_ratio, new_ratio = target, automatic = new_ratio.is_none(), "guest ratio adjusted");

        self.publish(Event::GuestRatioAdjusted {
            old_ratio,
            new_ratio: target,
            automatic: new_ratio.is_none(),
        });

        target
    }

    /// Split CPU between one guest A task and one guest B task without
    /// touching scheduler state.
    ///
    /// Guest A's quota is its priority as a fraction of 100, clamped into
    /// the fairness band; guest B receives the remainder.
    pub fn allocate_cpu(&self, guest_a: &Task, guest_b: &Task) -> CpuAllocation {
        let guest_a_quota =
            (f64::from(guest_a.priority) / 100.0).clamp(MIN_GUEST_SHARE, MAX_GUEST_SHARE);
        let allocation = CpuAllocation {
            guest_a_quota,
            guest_b_quota: 1.0 - guest_a_quota,
        };

        tracing::trace!(
            guest_a = %guest_a.id,
            guest_b = %guest_b.id,
            guest_a_quota = allocation.guest_a_quota,
            guest_b_quota = allocation.guest_b_quota,
            "cpu allocated"
        );

        allocation
    }

    /// Current probability of favoring guest A.
    pub fn guest_ratio(&self) -> f64 {
        f64::from_bits(self.inner.guest_ratio.load(AtomicOrdering::Acquire))
    }

    /// Snapshot of a single task.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.tasks.get(&task_id).map(|entry| entry.clone())
    }

    /// Snapshot of every task, terminated ones included.
    pub fn all_tasks(&self) -> HashMap<TaskId, Task> {
        self.inner
            .tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of the tasks owned by `domain`.
    pub fn tasks_by_domain(&self, domain: Domain) -> Vec<Task> {
        self.inner
            .tasks
            .iter()
            .filter(|entry| entry.domain == domain)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of `Ready` tasks.
    pub fn ready_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| entry.state == TaskState::Ready)
            .count()
    }

    /// Number of tasks held, terminated ones included.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Drop every terminated task from the registry and return how many were
    /// removed.  Only ever called by the host.
    pub fn purge_terminated(&self) -> usize {
        let before = self.inner.tasks.len();
        self.inner
            .tasks
            .retain(|_, task| task.state != TaskState::Terminated);
        let removed = before.saturating_sub(self.inner.tasks.len());
        if removed > 0 {
            tracing::info!(removed, "terminated tasks purged");
        }
        removed
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            native_selections: c.selections[0].load(AtomicOrdering::Relaxed),
            guest_a_selections: c.selections[1].load(AtomicOrdering::Relaxed),
            guest_b_selections: c.selections[2].load(AtomicOrdering::Relaxed),
            fallbacks: c.fallbacks.load(AtomicOrdering::Relaxed),
            empty_polls: c.empty_polls.load(AtomicOrdering::Relaxed),
            ratio_adjustments: c.ratio_adjustments.load(AtomicOrdering::Relaxed),
        }
    }

    // -- Private helpers ----------------------------------------------------

    fn flip_for_guest_a(&self) -> bool {
        let ratio = self.guest_ratio();
        let mut rng = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_bool(ratio)
    }

    /// Summed priority of non-terminated guest A and guest B tasks.
    fn guest_weights(&self) -> (i64, i64) {
        let mut weights = (0i64, 0i64);
        for entry in self.inner.tasks.iter() {
            if entry.state == TaskState::Terminated {
                continue;
            }
            let weight = i64::from(entry.priority.max(0));
            match entry.domain {
                Domain::GuestA => weights.0 += weight,
                Domain::GuestB => weights.1 += weight,
                Domain::Native => {}
            }
        }
        weights
    }

    fn record_selection(&self, task: &Task, fallback: bool) {
        let c = &self.inner.counters;
        c.selections[task.domain.index()].fetch_add(1, AtomicOrdering::Relaxed);
        if fallback {
            c.fallbacks.fetch_add(1, AtomicOrdering::Relaxed);
        }
        tracing::trace!(task_id = %task.id, domain = %task.domain, fallback, "task selected");
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.inner.bus {
            bus.publish(event);
        }
    }
}

impl Default for HybridScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Ranking inside one domain: higher priority first, then longest waiting,
/// then lowest id.  The smallest key is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SelectionKey {
    priority: Reverse<i32>,
    last_scheduled: DateTime<Utc>,
    id: TaskId,
}

impl SelectionKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: Reverse(task.priority),
            last_scheduled: task.last_scheduled,
            id: task.id,
        }
    }
}

/// Clamp into the fairness band.  `None` for NaN and infinities.
fn clamp_share(value: f64) -> Option<f64> {
    if !value.is_finite() {
        None
    } else {
        Some(value.clamp(MIN_GUEST_SHARE, MAX_GUEST_SHARE))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
