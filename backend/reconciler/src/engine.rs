//! Engine facade — the single entry point the daemon, the API and the tests
//! talk to. Owns the tracker and the scheduler and forwards every trigger
//! source (load, pledges, chain tip, refresh, wallet) into the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::errors::{FeedError, ReconcilerError, Result, VerificationError};
use crate::feed::{ProjectStatus, StatusFeed};
use crate::scheduler::{Scheduler, SchedulerConfig, Trigger};
use crate::source::{SharedSource, SourceSet};
use crate::surface::{self, Affinity, Mirror, PledgeSet, StateEvent, StateSurface, Subscription};
use crate::tracker::{ProjectSnapshot, ProjectTracker};
use crate::types::{
    Amount, CheckStatus, Pledge, PledgeKey, Project, ProjectId, ProjectStateInfo,
};
use crate::verifier::PledgeVerifier;
use crate::wallet::Wallet;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one source query.
    pub query_timeout: Duration,
    /// Chain-tip debounce window.
    pub debounce: Duration,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
            debounce: Duration::from_millis(750),
            retry_initial_backoff: Duration::from_secs(2),
            retry_max_backoff: Duration::from_secs(60),
        }
    }
}

/// Where a pledge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PledgeOrigin {
    Local,
    Feed,
}

impl PledgeOrigin {
    fn trigger(self) -> Trigger {
        match self {
            Self::Local => Trigger::LocalPledge,
            Self::Feed => Trigger::FeedPledge,
        }
    }
}

pub struct Engine {
    tracker: Arc<ProjectTracker>,
    scheduler: Scheduler,
    sources: Arc<SourceSet>,
    feed: Option<Arc<dyn StatusFeed>>,
    wallet: RwLock<Option<Arc<dyn Wallet>>>,
    runtime: Handle,
}

impl Engine {
    /// Build an engine on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        sources: Vec<SharedSource>,
        feed: Option<Arc<dyn StatusFeed>>,
    ) -> Arc<Self> {
        let runtime = Handle::current();
        let tracker = Arc::new(ProjectTracker::new(StateSurface::new()));
        let sources = Arc::new(SourceSet::new(sources));
        let scheduler = Scheduler::new(
            tracker.clone(),
            sources.clone(),
            PledgeVerifier::new(config.query_timeout),
            SchedulerConfig {
                debounce: config.debounce,
                retry_initial_backoff: config.retry_initial_backoff,
                retry_max_backoff: config.retry_max_backoff,
            },
            runtime.clone(),
        );
        Arc::new(Self {
            tracker,
            scheduler,
            sources,
            feed,
            wallet: RwLock::new(None),
            runtime,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Project lifecycle
    // ─────────────────────────────────────────────────────────

    /// Track a project and schedule its first pass. Returns `false` if it
    /// was already tracked.
    pub fn track_project(&self, project: Project) -> bool {
        let id = project.id.clone();
        if !self.tracker.track(project) {
            return false;
        }
        self.scheduler.trigger(&id, Trigger::Load);
        true
    }

    pub fn untrack_project(&self, id: &ProjectId) -> bool {
        let removed = self.tracker.untrack(id);
        self.scheduler.forget(id);
        removed
    }

    /// Send a project back to `Pending` and re-verify every pledge it holds.
    pub fn reset_project(&self, id: &ProjectId) -> std::result::Result<(), VerificationError> {
        self.tracker.reset(id)?;
        self.scheduler.trigger(id, Trigger::Manual);
        Ok(())
    }

    /// Check a pledge against its project without admitting it. Lets a
    /// caller persist the pledge before any pass can see it.
    pub fn check_pledge(&self, pledge: &Pledge) -> std::result::Result<PledgeKey, VerificationError> {
        self.tracker.check_pledge(pledge)
    }

    /// Add a candidate pledge. It stays uncounted until a pass verifies it.
    pub fn ingest_pledge(
        &self,
        pledge: Pledge,
        origin: PledgeOrigin,
    ) -> std::result::Result<PledgeKey, VerificationError> {
        let project_id = pledge.project_id.clone();
        let key = self.tracker.add_or_update_pledge(pledge).map_err(|e| {
            warn!(project = %project_id, ?origin, error = %e, "rejected pledge");
            e
        })?;
        self.scheduler.trigger(&project_id, origin.trigger());
        Ok(key)
    }

    /// Pull the status feed, if any, then verify the project now.
    pub async fn refresh(&self, id: &ProjectId) -> Result<()> {
        if !self.tracker.contains(id) {
            return Err(ReconcilerError::UnknownProject(id.clone()));
        }

        if let Some(feed) = &self.feed {
            match feed.fetch(id).await {
                Ok(status) => self.absorb_feed_status(status),
                Err(FeedError::NotFound(project_id)) => {
                    self.tracker.record_error(
                        id,
                        Arc::new(VerificationError::NotFound(project_id.clone())),
                    );
                    return Err(FeedError::NotFound(project_id).into());
                }
                Err(e) => {
                    warn!(project = %id, error = %e, "status feed unavailable; checking sources only");
                }
            }
        }

        self.scheduler.trigger(id, Trigger::Manual);
        Ok(())
    }

    /// Feed pledges are candidates like any other; the caller triggers the
    /// pass that verifies them.
    fn absorb_feed_status(&self, status: ProjectStatus) {
        let id = status.project_id.clone();
        let mut accepted = 0usize;
        for pledge in status.pledges {
            match self.tracker.add_or_update_pledge(pledge) {
                Ok(_) => accepted += 1,
                Err(e) => warn!(project = %id, error = %e, "ignoring pledge from status feed"),
            }
        }
        if let Some(claimed_by) = status.claimed_by {
            debug!(project = %id, %claimed_by, "status feed reports a claim");
        }
        debug!(
            project = %id,
            accepted,
            reported_value = status.value_pledged_so_far,
            "absorbed status feed"
        );
    }

    /// Chain tip moved: every project not yet claimed gets a debounced pass.
    pub fn on_new_block(&self) {
        let ids = self.tracker.ids_needing_recheck();
        debug!(projects = ids.len(), "new block");
        for id in ids {
            self.scheduler.trigger(&id, Trigger::ChainTip);
        }
    }

    /// Swap the UTXO source set. Passes already running keep the old set.
    pub fn set_sources(&self, sources: Vec<SharedSource>) {
        info!(sources = sources.len(), "UTXO sources replaced");
        self.sources.replace(sources);
    }

    // ─────────────────────────────────────────────────────────
    // Wallet
    // ─────────────────────────────────────────────────────────

    /// Connect a wallet. Revocations it reports trigger a manual pass; the
    /// engine's own revocation findings for the wallet's pledge are logged.
    pub fn attach_wallet(self: &Arc<Self>, wallet: Arc<dyn Wallet>) {
        let weak = Arc::downgrade(self);
        wallet.on_revoke(Box::new(move |pledge: &Pledge| {
            if let Some(engine) = weak.upgrade() {
                info!(project = %pledge.project_id, "wallet revoked its pledge");
                engine.scheduler.trigger(&pledge.project_id, Trigger::Manual);
            }
        }));

        let mut subscription = self.tracker.surface().subscribe();
        let weak = Arc::downgrade(self);
        let watched = wallet.clone();
        self.runtime.spawn(async move {
            while let Some(event) = subscription.recv().await {
                let StateEvent::PledgeRevoked {
                    project_id, key, by, ..
                } = event
                else {
                    continue;
                };
                let Some(engine) = weak.upgrade() else { break };
                let Some(project) = engine.project(&project_id) else {
                    continue;
                };
                if watched.pledge_for(&project).and_then(|p| p.key()) == Some(key) {
                    warn!(
                        project = %project_id,
                        pledge = %key,
                        revoked_by = %by,
                        "wallet pledge was spent elsewhere"
                    );
                }
            }
        });

        *self.wallet.write().unwrap_or_else(PoisonError::into_inner) = Some(wallet);
    }

    pub fn wallet(&self) -> Option<Arc<dyn Wallet>> {
        self.wallet
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub fn project(&self, id: &ProjectId) -> Option<Arc<Project>> {
        self.tracker.project(id)
    }

    pub fn state_info(&self, id: &ProjectId) -> Option<ProjectStateInfo> {
        self.tracker.state_info(id)
    }

    pub fn check_status(&self, id: &ProjectId) -> Option<CheckStatus> {
        self.tracker.check_status(id)
    }

    pub fn snapshot(&self, id: &ProjectId) -> Option<Arc<ProjectSnapshot>> {
        self.tracker.snapshot(id)
    }

    pub fn snapshots(&self) -> Vec<Arc<ProjectSnapshot>> {
        self.tracker.snapshots()
    }

    pub fn tracked_ids(&self) -> Vec<ProjectId> {
        self.tracker.tracked_ids()
    }

    pub fn subscribe(&self) -> Subscription {
        self.tracker.surface().subscribe()
    }

    /// No pass running and no debounce or retry timer armed.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    pub fn passes_started(&self) -> u64 {
        self.scheduler.passes_started()
    }

    pub fn passes_completed(&self) -> u64 {
        self.scheduler.passes_completed()
    }

    // ─────────────────────────────────────────────────────────
    // Mirrors
    // ─────────────────────────────────────────────────────────

    pub fn mirror_project_states(
        &self,
        affinity: &Affinity,
    ) -> Mirror<HashMap<ProjectId, ProjectStateInfo>> {
        let (subscription, snapshots) = self.tracker.subscribe_with_snapshots();
        surface::mirror_project_states(affinity, subscription, &snapshots)
    }

    pub fn mirror_check_statuses(
        &self,
        affinity: &Affinity,
    ) -> Mirror<HashMap<ProjectId, CheckStatus>> {
        let (subscription, snapshots) = self.tracker.subscribe_with_snapshots();
        surface::mirror_check_statuses(affinity, subscription, &snapshots)
    }

    pub fn mirror_open_pledges(
        &self,
        project_id: &ProjectId,
        affinity: &Affinity,
    ) -> Mirror<Vec<Arc<Pledge>>> {
        let (subscription, snapshots) = self.tracker.subscribe_with_snapshots();
        surface::mirror_pledges(
            affinity,
            subscription,
            &snapshots,
            project_id.clone(),
            PledgeSet::Open,
        )
    }

    pub fn mirror_claimed_pledges(
        &self,
        project_id: &ProjectId,
        affinity: &Affinity,
    ) -> Mirror<Vec<Arc<Pledge>>> {
        let (subscription, snapshots) = self.tracker.subscribe_with_snapshots();
        surface::mirror_pledges(
            affinity,
            subscription,
            &snapshots,
            project_id.clone(),
            PledgeSet::Claimed,
        )
    }

    pub fn mirror_total_pledged(&self, project_id: &ProjectId, affinity: &Affinity) -> Mirror<Amount> {
        let (subscription, snapshots) = self.tracker.subscribe_with_snapshots();
        surface::mirror_total_pledged(affinity, subscription, &snapshots, project_id.clone())
    }
}
