//! Observable state surface.
//!
//! The tracker publishes a [`StateEvent`] for every mutation. Consumers either
//! drain a raw [`Subscription`] or ask for a [`Mirror`], a read-only view kept
//! up to date by a task running on the consumer's chosen [`Affinity`]. Each
//! mirror applies its events one at a time on that runtime, so its
//! notifications never overlap.
//!
//! Publishing is a non-blocking send into one unbounded queue per subscriber;
//! a slow consumer delays only itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::tracker::ProjectSnapshot;
use crate::types::{Amount, CheckStatus, Pledge, PledgeKey, ProjectId, ProjectStateInfo, TxHash};

/// Execution context that delivers a mirror's updates.
pub type Affinity = Handle;

#[derive(Debug, Clone)]
pub enum StateEvent {
    ProjectChanged(Arc<ProjectSnapshot>),
    ProjectRemoved {
        project_id: ProjectId,
        revision: u64,
    },
    PledgeRevoked {
        project_id: ProjectId,
        key: PledgeKey,
        by: TxHash,
        revision: u64,
    },
}

impl StateEvent {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            Self::ProjectChanged(snapshot) => &snapshot.project.id,
            Self::ProjectRemoved { project_id, .. } | Self::PledgeRevoked { project_id, .. } => {
                project_id
            }
        }
    }

    /// Revisions are drawn from one counter shared by all projects.
    pub fn revision(&self) -> u64 {
        match self {
            Self::ProjectChanged(snapshot) => snapshot.revision,
            Self::ProjectRemoved { revision, .. } | Self::PledgeRevoked { revision, .. } => {
                *revision
            }
        }
    }
}

pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StateEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<StateEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StateEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone, Default)]
pub struct StateSurface {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StateEvent>>>>,
}

impl StateSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, event: StateEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Read-only, live-updating view.
pub struct Mirror<T> {
    rx: watch::Receiver<T>,
}

impl<T> Mirror<T> {
    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.rx.borrow()
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.rx.borrow().clone()
    }

    /// Wait for the next update. Returns `false` once the view can no
    /// longer change.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Seed a view from `snapshots` and keep folding events into it on
/// `affinity`. `subscription` must have been opened before the snapshots were
/// taken; events already reflected in a snapshot are skipped by revision.
fn spawn_mirror<T, F>(
    affinity: &Affinity,
    initial: T,
    snapshots: &[Arc<ProjectSnapshot>],
    mut subscription: Subscription,
    mut apply: F,
) -> Mirror<T>
where
    T: Send + Sync + 'static,
    F: FnMut(&mut T, &StateEvent) -> bool + Send + 'static,
{
    let mut seen: HashMap<ProjectId, u64> = snapshots
        .iter()
        .map(|s| (s.project.id.clone(), s.revision))
        .collect();
    let (tx, rx) = watch::channel(initial);

    affinity.spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    let last = seen.entry(event.project_id().clone()).or_insert(0);
                    if event.revision() <= *last {
                        continue;
                    }
                    *last = event.revision();
                    tx.send_if_modified(|view| apply(view, &event));
                }
            }
        }
    });

    Mirror { rx }
}

pub(crate) fn mirror_project_states(
    affinity: &Affinity,
    subscription: Subscription,
    snapshots: &[Arc<ProjectSnapshot>],
) -> Mirror<HashMap<ProjectId, ProjectStateInfo>> {
    let initial = snapshots
        .iter()
        .map(|s| (s.project.id.clone(), s.info.clone()))
        .collect();
    spawn_mirror(affinity, initial, snapshots, subscription, |view, event| {
        match event {
            StateEvent::ProjectChanged(s) => {
                view.insert(s.project.id.clone(), s.info.clone()).as_ref() != Some(&s.info)
            }
            StateEvent::ProjectRemoved { project_id, .. } => view.remove(project_id).is_some(),
            StateEvent::PledgeRevoked { .. } => false,
        }
    })
}

pub(crate) fn mirror_check_statuses(
    affinity: &Affinity,
    subscription: Subscription,
    snapshots: &[Arc<ProjectSnapshot>],
) -> Mirror<HashMap<ProjectId, CheckStatus>> {
    let initial = snapshots
        .iter()
        .filter_map(|s| s.check.clone().map(|c| (s.project.id.clone(), c)))
        .collect();
    spawn_mirror(affinity, initial, snapshots, subscription, |view, event| {
        match event {
            StateEvent::ProjectChanged(s) => match &s.check {
                Some(check) => {
                    view.insert(s.project.id.clone(), check.clone()).as_ref() != Some(check)
                }
                None => view.remove(&s.project.id).is_some(),
            },
            StateEvent::ProjectRemoved { project_id, .. } => view.remove(project_id).is_some(),
            StateEvent::PledgeRevoked { .. } => false,
        }
    })
}

/// Which pledge set a pledge mirror follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PledgeSet {
    Open,
    Claimed,
}

fn pledges_of(snapshot: &ProjectSnapshot, set: PledgeSet) -> &[Arc<Pledge>] {
    match set {
        PledgeSet::Open => &snapshot.open,
        PledgeSet::Claimed => &snapshot.claimed,
    }
}

/// Newest first, like the snapshots they are copied from.
pub(crate) fn mirror_pledges(
    affinity: &Affinity,
    subscription: Subscription,
    snapshots: &[Arc<ProjectSnapshot>],
    project_id: ProjectId,
    set: PledgeSet,
) -> Mirror<Vec<Arc<Pledge>>> {
    let initial = snapshots
        .iter()
        .find(|s| s.project.id == project_id)
        .map(|s| pledges_of(s, set).to_vec())
        .unwrap_or_default();
    spawn_mirror(affinity, initial, snapshots, subscription, move |view, event| {
        match event {
            StateEvent::ProjectChanged(s) if s.project.id == project_id => {
                let next = pledges_of(s, set);
                if view.as_slice() == next {
                    return false;
                }
                *view = next.to_vec();
                true
            }
            StateEvent::ProjectRemoved { project_id: id, .. } if *id == project_id => {
                let changed = !view.is_empty();
                view.clear();
                changed
            }
            _ => false,
        }
    })
}

/// Running total of open plus claimed pledges for one project.
pub(crate) fn mirror_total_pledged(
    affinity: &Affinity,
    subscription: Subscription,
    snapshots: &[Arc<ProjectSnapshot>],
    project_id: ProjectId,
) -> Mirror<Amount> {
    let initial = snapshots
        .iter()
        .find(|s| s.project.id == project_id)
        .map(|s| s.info.value_pledged)
        .unwrap_or(0);
    spawn_mirror(affinity, initial, snapshots, subscription, move |total, event| {
        let next = match event {
            StateEvent::ProjectChanged(s) if s.project.id == project_id => s.info.value_pledged,
            StateEvent::ProjectRemoved { project_id: id, .. } if *id == project_id => 0,
            _ => return false,
        };
        if *total == next {
            return false;
        }
        *total = next;
        true
    })
}
