//! Reconciliation scheduler — decides when each project is verified.
//!
//! ## Rules
//!
//! * At most one pass per project is in flight. A trigger that arrives while
//!   a pass runs sets a follow-up flag; however many arrive, exactly one
//!   extra pass runs once the current one finishes.
//! * Chain-tip triggers are debounced per project: the first arms a timer
//!   and the rest arriving before it fires are dropped.
//! * Every other trigger (load, new pledge, manual refresh) skips the
//!   debounce window but still obeys the one-in-flight rule.
//! * A pass that fails on a transient source error schedules one retry after
//!   an exponential back-off, up to [`SchedulerConfig::retry_max_backoff`].
//!   The back-off resets after a pass without transient errors.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::source::SourceSet;
use crate::tracker::ProjectTracker;
use crate::types::ProjectId;
use crate::verifier::PledgeVerifier;

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Project loaded into the tracked set.
    Load,
    /// Pledge submitted locally.
    LocalPledge,
    /// Pledge learned from the status feed.
    FeedPledge,
    /// New block or chain-tip change.
    ChainTip,
    /// Explicit refresh.
    Manual,
    /// Back-off retry after a transient failure.
    Retry,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Load => "load",
            Self::LocalPledge => "local_pledge",
            Self::FeedPledge => "feed_pledge",
            Self::ChainTip => "chain_tip",
            Self::Manual => "manual",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: bool,
    rerun: bool,
    debounce_armed: bool,
    retry_armed: bool,
    backoff: Option<Duration>,
}

impl Slot {
    fn is_quiet(&self) -> bool {
        !self.in_flight && !self.debounce_armed && !self.retry_armed
    }
}

struct Inner {
    tracker: Arc<ProjectTracker>,
    sources: Arc<SourceSet>,
    verifier: PledgeVerifier,
    config: SchedulerConfig,
    runtime: Handle,
    slots: Mutex<HashMap<ProjectId, Slot>>,
    passes_started: AtomicU64,
    passes_completed: AtomicU64,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        tracker: Arc<ProjectTracker>,
        sources: Arc<SourceSet>,
        verifier: PledgeVerifier,
        config: SchedulerConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tracker,
                sources,
                verifier,
                config,
                runtime,
                slots: Mutex::new(HashMap::new()),
                passes_started: AtomicU64::new(0),
                passes_completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn trigger(&self, id: &ProjectId, trigger: Trigger) {
        if trigger == Trigger::ChainTip {
            self.inner.debounce(id);
        } else {
            self.inner.request_pass(id, trigger);
        }
    }

    /// Drop pending follow-ups for a project that is no longer tracked.
    pub fn forget(&self, id: &ProjectId) {
        let mut slots = self.inner.slots();
        if let Some(slot) = slots.get_mut(id) {
            slot.rerun = false;
            slot.backoff = None;
            if slot.is_quiet() {
                slots.remove(id);
            }
        }
    }

    /// No pass running and no timer armed for any project.
    pub fn is_idle(&self) -> bool {
        self.inner.slots().values().all(Slot::is_quiet)
    }

    pub fn passes_started(&self) -> u64 {
        self.inner.passes_started.load(Ordering::SeqCst)
    }

    pub fn passes_completed(&self) -> u64 {
        self.inner.passes_completed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<ProjectId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn debounce(self: &Arc<Self>, id: &ProjectId) {
        {
            let mut slots = self.slots();
            let slot = slots.entry(id.clone()).or_default();
            if slot.debounce_armed {
                debug!(project = %id, "chain-tip trigger coalesced");
                return;
            }
            slot.debounce_armed = true;
        }

        let inner = self.clone();
        let id = id.clone();
        let delay = self.config.debounce;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(slot) = inner.slots().get_mut(&id) {
                slot.debounce_armed = false;
            }
            inner.request_pass(&id, Trigger::ChainTip);
        });
    }

    fn request_pass(self: &Arc<Self>, id: &ProjectId, trigger: Trigger) {
        {
            let mut slots = self.slots();
            if !self.tracker.contains(id) {
                if slots.get(id).is_some_and(Slot::is_quiet) {
                    slots.remove(id);
                }
                debug!(project = %id, %trigger, "ignoring trigger for untracked project");
                return;
            }
            let slot = slots.entry(id.clone()).or_default();
            if slot.in_flight {
                slot.rerun = true;
                debug!(project = %id, %trigger, "pass in flight; follow-up requested");
                return;
            }
            slot.in_flight = true;
        }

        debug!(project = %id, %trigger, "starting verification pass");
        let inner = self.clone();
        let id = id.clone();
        self.runtime.spawn(async move { inner.drive(id).await });
    }

    /// Run passes until no follow-up is pending, then release the slot.
    async fn drive(self: Arc<Self>, id: ProjectId) {
        loop {
            if let Some(transient) = self.run_pass(&id).await {
                self.note_outcome(&id, transient);
            }

            let again = {
                let mut slots = self.slots();
                match slots.get_mut(&id) {
                    Some(slot) if slot.rerun => {
                        slot.rerun = false;
                        true
                    }
                    Some(slot) => {
                        slot.in_flight = false;
                        if slot.is_quiet() && !self.tracker.contains(&id) {
                            slots.remove(&id);
                        }
                        false
                    }
                    None => false,
                }
            };
            if !again {
                break;
            }
            debug!(project = %id, "running follow-up pass");
        }
    }

    /// One verification pass. Returns whether it hit a transient failure, or
    /// `None` if the project is no longer tracked.
    async fn run_pass(&self, id: &ProjectId) -> Option<bool> {
        let ticket = self.tracker.begin_pass(id)?;
        self.passes_started.fetch_add(1, Ordering::SeqCst);
        let sources = self.sources.current();
        debug!(
            project = %id,
            pledges = ticket.pledges.len(),
            sources = sources.len(),
            "verification pass started"
        );

        let verifications = ticket.pledges.iter().map(|(key, pledge)| {
            let project = &ticket.project;
            let sources = &sources;
            async move {
                let result = self
                    .verifier
                    .verify(project, pledge, sources)
                    .await
                    .map_err(Arc::new);
                (*key, result)
            }
        });
        let results = join_all(verifications).await;

        let mut failure = None;
        let mut advisory = None;
        for (key, result) in &results {
            match result {
                Err(e) => {
                    failure.get_or_insert_with(|| e.clone());
                }
                Ok(v) => {
                    if let Some(a) = &v.advisory {
                        advisory.get_or_insert_with(|| a.clone());
                    }
                }
            }
            self.tracker
                .apply_verification_result(id, ticket.epoch, *key, result);
        }

        let transient = failure
            .as_ref()
            .is_some_and(|e: &Arc<_>| e.kind().is_transient());
        if let Some(e) = &failure {
            warn!(project = %id, error = %e, "verification pass failed");
        }
        self.tracker
            .complete_pass(id, ticket.epoch, failure.or(advisory));
        self.passes_completed.fetch_add(1, Ordering::SeqCst);
        Some(transient)
    }

    fn note_outcome(self: &Arc<Self>, id: &ProjectId, transient: bool) {
        let delay = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(id) else {
                return;
            };
            if !transient {
                slot.backoff = None;
                return;
            }
            let next = slot.backoff.map_or(self.config.retry_initial_backoff, |b| {
                (b * 2).min(self.config.retry_max_backoff)
            });
            slot.backoff = Some(next);
            if slot.retry_armed {
                return;
            }
            slot.retry_armed = true;
            next
        };

        warn!(project = %id, retry_in = ?delay, "scheduling retry");
        let inner = self.clone();
        let id = id.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(slot) = inner.slots().get_mut(&id) {
                slot.retry_armed = false;
            }
            inner.request_pass(&id, Trigger::Retry);
        });
    }
}
