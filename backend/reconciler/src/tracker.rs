//! Project state tracker.
//!
//! One record per tracked project, each behind its own mutex. The outer map
//! lock is only held to look records up or to add/remove them, so mutations
//! of unrelated projects never wait on each other. Every mutation runs to
//! completion under the record's lock and publishes a fresh snapshot before
//! releasing it.
//!
//! Pledge classification per project:
//!
//! | Set       | Counted in `value_pledged` | Re-verified on a pass |
//! |-----------|----------------------------|-----------------------|
//! | pending   | no                         | yes                   |
//! | open      | yes                        | yes                   |
//! | claimed   | yes                        | no (settlement final) |
//!
//! Revoked pledges are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::errors::VerificationError;
use crate::surface::{StateEvent, StateSurface, Subscription};
use crate::types::{
    Amount, CheckStatus, Pledge, PledgeKey, Project, ProjectId, ProjectState, ProjectStateInfo,
    Transaction, TxHash,
};
use crate::verifier::{PledgeStatus, Verification};

/// Immutable view of one project, as published to subscribers.
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    pub project: Arc<Project>,
    pub info: ProjectStateInfo,
    pub check: Option<CheckStatus>,
    /// Newest first.
    pub open: Vec<Arc<Pledge>>,
    /// Newest first.
    pub claimed: Vec<Arc<Pledge>>,
    pub pending: usize,
    pub revision: u64,
}

/// Work handed to a verification pass.
#[derive(Debug, Clone)]
pub struct PassTicket {
    pub project: Arc<Project>,
    pub epoch: u64,
    pub pledges: Vec<(PledgeKey, Arc<Pledge>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The project was removed or reset after the pass started.
    Discarded,
}

struct ProjectRecord {
    project: Arc<Project>,
    state: ProjectState,
    claimed_by: Option<TxHash>,
    pending: HashMap<PledgeKey, Arc<Pledge>>,
    open: HashMap<PledgeKey, Arc<Pledge>>,
    claimed: HashMap<PledgeKey, Arc<Pledge>>,
    check: Option<CheckStatus>,
    /// Drawn from the tracker-wide counter on track and on reset, so no two
    /// records ever share one. Passes carry the epoch they started in.
    epoch: u64,
    revision: u64,
    removed: bool,
}

impl ProjectRecord {
    fn new(project: Project, epoch: u64) -> Self {
        Self {
            project: Arc::new(project),
            state: ProjectState::Unknown,
            claimed_by: None,
            pending: HashMap::new(),
            open: HashMap::new(),
            claimed: HashMap::new(),
            check: None,
            epoch,
            revision: 0,
            removed: false,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.removed && self.epoch == epoch
    }

    fn value_pledged(&self) -> Amount {
        self.open
            .values()
            .chain(self.claimed.values())
            .fold(0, |sum: Amount, p| sum.saturating_add(p.total_input_value))
    }

    fn info(&self) -> ProjectStateInfo {
        ProjectStateInfo {
            state: self.state,
            value_pledged: self.value_pledged(),
            claimed_by: self.claimed_by,
        }
    }

    fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project: self.project.clone(),
            info: self.info(),
            check: self.check.clone(),
            open: newest_first(&self.open),
            claimed: newest_first(&self.claimed),
            pending: self.pending.len(),
            revision: self.revision,
        }
    }

    fn admit(&self, pledge: &Pledge) -> Result<PledgeKey, VerificationError> {
        if self.removed {
            return Err(VerificationError::NotFound(pledge.project_id.clone()));
        }
        pledge.validate_for(&self.project)?;
        pledge
            .key()
            .ok_or_else(|| VerificationError::MalformedPledge("pledge has no identity".into()))
    }

    fn take_unclaimed(&mut self, key: &PledgeKey) -> Option<Arc<Pledge>> {
        self.open.remove(key).or_else(|| self.pending.remove(key))
    }

    fn move_to_claimed(&mut self, key: PledgeKey) {
        if let Some(pledge) = self.take_unclaimed(&key) {
            self.claimed.insert(key, pledge);
        }
    }

    /// Claim the pledge and every other unclaimed pledge `settlement` spends.
    fn settle(&mut self, key: PledgeKey, settlement: &Transaction) {
        if self.state != ProjectState::Claimed {
            self.state = ProjectState::Claimed;
            self.claimed_by = Some(settlement.txid);
            info!(
                project = %self.project.id,
                claimed_by = %settlement.txid,
                "project claimed"
            );
        }
        self.move_to_claimed(key);

        let swept: Vec<PledgeKey> = self
            .open
            .iter()
            .chain(self.pending.iter())
            .filter(|(_, p)| p.outpoints().iter().any(|op| settlement.spends(op)))
            .map(|(k, _)| *k)
            .collect();
        for key in swept {
            self.move_to_claimed(key);
        }
    }
}

fn newest_first(set: &HashMap<PledgeKey, Arc<Pledge>>) -> Vec<Arc<Pledge>> {
    let mut pledges: Vec<Arc<Pledge>> = set.values().cloned().collect();
    pledges.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    pledges
}

fn lock(record: &Mutex<ProjectRecord>) -> MutexGuard<'_, ProjectRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProjectTracker {
    projects: RwLock<HashMap<ProjectId, Arc<Mutex<ProjectRecord>>>>,
    revisions: AtomicU64,
    epochs: AtomicU64,
    surface: StateSurface,
}

impl ProjectTracker {
    pub fn new(surface: StateSurface) -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            revisions: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            surface,
        }
    }

    fn record(&self, id: &ProjectId) -> Option<Arc<Mutex<ProjectRecord>>> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, rec: &mut ProjectRecord) {
        rec.revision = self.next_revision();
        self.surface
            .publish(StateEvent::ProjectChanged(Arc::new(rec.snapshot())));
    }

    /// Start tracking `project` in the `Unknown` state. Returns `false` if it
    /// was already tracked.
    pub fn track(&self, project: Project) -> bool {
        let mut projects = self
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if projects.contains_key(&project.id) {
            return false;
        }
        let id = project.id.clone();
        let record = Arc::new(Mutex::new(ProjectRecord::new(project, self.next_epoch())));
        projects.insert(id.clone(), record.clone());
        let mut rec = lock(&record);
        drop(projects);

        self.publish(&mut rec);
        info!(project = %id, "tracking project");
        true
    }

    /// Stop tracking. Results of passes still in flight are discarded.
    pub fn untrack(&self, id: &ProjectId) -> bool {
        let removed = self
            .projects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        let Some(record) = removed else {
            return false;
        };
        let mut rec = lock(&record);
        rec.removed = true;
        self.surface.publish(StateEvent::ProjectRemoved {
            project_id: id.clone(),
            revision: self.next_revision(),
        });
        info!(project = %id, "stopped tracking project");
        true
    }

    /// Explicit reset: back to `Pending`, every pledge awaiting
    /// re-verification, claim pointer cleared.
    pub fn reset(&self, id: &ProjectId) -> Result<(), VerificationError> {
        let record = self
            .record(id)
            .ok_or_else(|| VerificationError::NotFound(id.clone()))?;
        let mut guard = lock(&record);
        let rec = &mut *guard;
        rec.epoch = self.next_epoch();
        rec.state = ProjectState::Pending;
        rec.claimed_by = None;
        rec.check = None;
        rec.pending.extend(rec.open.drain().chain(rec.claimed.drain()));
        self.publish(rec);
        info!(project = %id, epoch = rec.epoch, "project reset");
        Ok(())
    }

    /// Insert a pledge, or replace the one sharing its key in whichever set
    /// holds it. New pledges wait in `pending` until verified. Structurally
    /// invalid pledges are rejected and never stored.
    pub fn add_or_update_pledge(&self, pledge: Pledge) -> Result<PledgeKey, VerificationError> {
        let record = self
            .record(&pledge.project_id)
            .ok_or_else(|| VerificationError::NotFound(pledge.project_id.clone()))?;
        let mut rec = lock(&record);
        let key = rec.admit(&pledge)?;
        let pledge = Arc::new(pledge);

        if let Some(slot) = rec.claimed.get_mut(&key) {
            *slot = pledge;
        } else if let Some(slot) = rec.open.get_mut(&key) {
            *slot = pledge;
        } else if rec.pending.insert(key, pledge).is_none() {
            debug!(project = %rec.project.id, pledge = %key, "pledge added");
        }
        if rec.state == ProjectState::Unknown {
            rec.state = ProjectState::Pending;
        }
        self.publish(&mut rec);
        Ok(key)
    }

    /// Run the checks `add_or_update_pledge` would, without storing
    /// anything. Returns the key the pledge would be stored under.
    pub fn check_pledge(&self, pledge: &Pledge) -> Result<PledgeKey, VerificationError> {
        let record = self
            .record(&pledge.project_id)
            .ok_or_else(|| VerificationError::NotFound(pledge.project_id.clone()))?;
        let rec = lock(&record);
        rec.admit(pledge)
    }

    /// Snapshot the pledges a pass should verify. Claimed pledges are final
    /// and skipped.
    pub fn begin_pass(&self, id: &ProjectId) -> Option<PassTicket> {
        let record = self.record(id)?;
        let mut rec = lock(&record);
        if rec.removed {
            return None;
        }
        if rec.state == ProjectState::Unknown {
            rec.state = ProjectState::Pending;
            self.publish(&mut rec);
        }
        let pledges = rec
            .pending
            .iter()
            .chain(rec.open.iter())
            .map(|(k, p)| (*k, p.clone()))
            .collect();
        Some(PassTicket {
            project: rec.project.clone(),
            epoch: rec.epoch,
            pledges,
        })
    }

    /// Fold one pledge's verification outcome into its project. A failed
    /// verification records the error and leaves the pledge where it was.
    pub fn apply_verification_result(
        &self,
        id: &ProjectId,
        epoch: u64,
        key: PledgeKey,
        result: &Result<Verification, Arc<VerificationError>>,
    ) -> ApplyOutcome {
        let Some(record) = self.record(id) else {
            return ApplyOutcome::Discarded;
        };
        let mut rec = lock(&record);
        if !rec.is_current(epoch) {
            debug!(project = %id, pledge = %key, "discarding stale verification result");
            return ApplyOutcome::Discarded;
        }

        let verification = match result {
            Err(e) => {
                rec.check = Some(CheckStatus::error(e.clone()));
                self.publish(&mut rec);
                return ApplyOutcome::Applied;
            }
            Ok(v) => v,
        };
        if let Some(advisory) = &verification.advisory {
            warn!(project = %id, pledge = %key, "{advisory}");
            rec.check = Some(CheckStatus::error(advisory.clone()));
        }

        match &verification.status {
            PledgeStatus::Open => {
                if let Some(pledge) = rec.pending.remove(&key) {
                    rec.open.insert(key, pledge);
                }
            }
            PledgeStatus::Claimed { settlement } => match rec.claimed_by {
                Some(existing) if existing != settlement.txid => {
                    warn!(
                        project = %id,
                        pledge = %key,
                        claimed_by = %existing,
                        spent_by = %settlement.txid,
                        "pledge spent by a second settlement; keeping the first claim"
                    );
                    self.revoke(&mut rec, key, settlement.txid);
                }
                _ => rec.settle(key, settlement),
            },
            PledgeStatus::Revoked { by } => self.revoke(&mut rec, key, *by),
        }

        self.publish(&mut rec);
        ApplyOutcome::Applied
    }

    fn revoke(&self, rec: &mut ProjectRecord, key: PledgeKey, by: TxHash) {
        if rec.take_unclaimed(&key).is_none() {
            return;
        }
        info!(project = %rec.project.id, pledge = %key, revoked_by = %by, "pledge revoked");
        self.surface.publish(StateEvent::PledgeRevoked {
            project_id: rec.project.id.clone(),
            key,
            by,
            revision: self.next_revision(),
        });
    }

    /// Close a pass. `error` is the first failure (or advisory) the pass
    /// saw; `None` clears the project's check status. A `Pending` project
    /// opens once a pass completes without a blocking error.
    pub fn complete_pass(
        &self,
        id: &ProjectId,
        epoch: u64,
        error: Option<Arc<VerificationError>>,
    ) -> ApplyOutcome {
        let Some(record) = self.record(id) else {
            return ApplyOutcome::Discarded;
        };
        let mut rec = lock(&record);
        if !rec.is_current(epoch) {
            return ApplyOutcome::Discarded;
        }

        let blocking = error.as_ref().is_some_and(|e| !e.kind().is_advisory());
        if !blocking && matches!(rec.state, ProjectState::Unknown | ProjectState::Pending) {
            rec.state = ProjectState::Open;
            info!(project = %id, value_pledged = rec.value_pledged(), "project open");
        }
        rec.check = Some(match error {
            Some(e) => CheckStatus::error(e),
            None => CheckStatus::ok(),
        });
        self.publish(&mut rec);
        ApplyOutcome::Applied
    }

    /// Record an error that did not come out of a pass, e.g. from the status
    /// feed. State is unchanged.
    pub fn record_error(&self, id: &ProjectId, error: Arc<VerificationError>) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.removed {
            return false;
        }
        rec.check = Some(CheckStatus::error(error));
        self.publish(&mut rec);
        true
    }

    pub fn contains(&self, id: &ProjectId) -> bool {
        self.record(id).is_some()
    }

    pub fn project(&self, id: &ProjectId) -> Option<Arc<Project>> {
        self.record(id).map(|r| lock(&r).project.clone())
    }

    pub fn state_info(&self, id: &ProjectId) -> Option<ProjectStateInfo> {
        self.record(id).map(|r| lock(&r).info())
    }

    pub fn check_status(&self, id: &ProjectId) -> Option<CheckStatus> {
        self.record(id).and_then(|r| lock(&r).check.clone())
    }

    pub fn snapshot(&self, id: &ProjectId) -> Option<Arc<ProjectSnapshot>> {
        self.record(id).map(|r| Arc::new(lock(&r).snapshot()))
    }

    pub fn snapshots(&self) -> Vec<Arc<ProjectSnapshot>> {
        let records: Vec<_> = self
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records
            .iter()
            .map(|r| Arc::new(lock(r).snapshot()))
            .collect()
    }

    /// Subscribe, then snapshot, so a mirror seeded from the snapshots misses
    /// nothing published in between.
    pub fn subscribe_with_snapshots(&self) -> (Subscription, Vec<Arc<ProjectSnapshot>>) {
        let subscription = self.surface.subscribe();
        (subscription, self.snapshots())
    }

    pub fn tracked_ids(&self) -> Vec<ProjectId> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Projects a new block could affect: everything not yet claimed.
    pub fn ids_needing_recheck(&self) -> Vec<ProjectId> {
        let records: Vec<_> = self
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        records
            .into_iter()
            .filter(|(_, r)| lock(r).state != ProjectState::Claimed)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn surface(&self) -> &StateSurface {
        &self.surface
    }
}
