use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::engine::{Engine, PledgeOrigin};
use crate::errors::{ErrorKind, FeedError, ReconcilerError};
use crate::feed::{ProjectStatus, StatusFeed};
use crate::invariants::{
    assert_all_snapshot_invariants, assert_claim_stable, assert_valid_state_transition,
};
use crate::surface::{StateEvent, Subscription};
use crate::testutil::{
    engine_with, outpoint, pledge_for, project_with_goal, settle, settlement_tx, unrelated_tx,
    MockFeed, MockSource, MockWallet,
};
use crate::types::{Pledge, PledgeKey, Project, ProjectState};

const GOAL: u64 = 1_000_000;

/// Drain every event published so far.
fn drain(sub: &mut Subscription) -> Vec<StateEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

/// Distinct consecutive states seen in `events`, checking every step is a
/// legal transition and every snapshot is internally consistent.
fn state_trail(events: &[StateEvent]) -> Vec<ProjectState> {
    let mut trail: Vec<ProjectState> = Vec::new();
    for event in events {
        if let StateEvent::ProjectChanged(snapshot) = event {
            assert_all_snapshot_invariants(snapshot);
            let state = snapshot.info.state;
            if let Some(&last) = trail.last() {
                assert_valid_state_transition(last, state);
                if last == state {
                    continue;
                }
            }
            trail.push(state);
        }
    }
    trail
}

struct Funded {
    engine: Arc<Engine>,
    a: Arc<MockSource>,
    b: Arc<MockSource>,
    project: Project,
    pledge: Pledge,
    key: PledgeKey,
}

/// A project with one pledge covering the full goal, verified open by two
/// agreeing sources.
async fn funded_project() -> Funded {
    let a = MockSource::named("a");
    let b = MockSource::named("b");
    let op = outpoint(1);
    a.set_unspent(op, Some(GOAL));
    b.set_unspent(op, Some(GOAL));

    let engine = engine_with(&[&a, &b], None);
    let project = project_with_goal(GOAL);
    assert!(engine.track_project(project.clone()));
    let pledge = pledge_for(&project, &[op], GOAL);
    let key = engine
        .ingest_pledge(pledge.clone(), PledgeOrigin::Local)
        .unwrap();
    settle(&engine).await;

    Funded {
        engine,
        a,
        b,
        project,
        pledge,
        key,
    }
}

// ─────────────────────────────────────────────────────────
// Core lifecycle
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn empty_project_goes_pending_then_open() {
    let a = MockSource::named("a");
    let engine = engine_with(&[&a], None);
    let mut sub = engine.subscribe();
    let project = project_with_goal(GOAL);

    engine.track_project(project.clone());
    settle(&engine).await;

    let trail = state_trail(&drain(&mut sub));
    assert_eq!(
        trail,
        vec![ProjectState::Unknown, ProjectState::Pending, ProjectState::Open]
    );
    let info = engine.state_info(&project.id).unwrap();
    assert_eq!(info.value_pledged, 0);
    assert!(!engine.check_status(&project.id).unwrap().is_error());
    assert_eq!(a.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn confirmed_pledge_funds_the_project() {
    let f = funded_project().await;

    let snap = f.engine.snapshot(&f.project.id).unwrap();
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.value_pledged, GOAL);
    assert_eq!(snap.open.len(), 1);
    assert_eq!(snap.open[0].key(), Some(f.key));
    assert_eq!(snap.pending, 0);
    assert!(f.project.is_fully_funded(snap.info.value_pledged));
    assert_all_snapshot_invariants(&snap);
}

#[tokio::test(start_paused = true)]
async fn settlement_claims_and_the_claim_sticks() {
    let f = funded_project().await;
    let claim = settlement_tx(&f.project, &[outpoint(1)]);
    f.a.set_spent(outpoint(1), claim.clone());
    f.b.set_spent(outpoint(1), claim.clone());

    f.engine.on_new_block();
    settle(&f.engine).await;

    let claimed = f.engine.snapshot(&f.project.id).unwrap();
    assert_eq!(claimed.info.state, ProjectState::Claimed);
    assert_eq!(claimed.info.claimed_by, Some(claim.txid));
    assert_eq!(claimed.claimed.len(), 1);
    assert_eq!(claimed.info.value_pledged, GOAL);
    assert_all_snapshot_invariants(&claimed);

    // Further blocks leave a claimed project alone, whatever sources say.
    f.a.set_unspent(outpoint(1), Some(GOAL));
    let passes = f.engine.passes_started();
    for _ in 0..3 {
        f.engine.on_new_block();
        settle(&f.engine).await;
    }
    assert_eq!(f.engine.passes_started(), passes);

    let later = f.engine.state_info(&f.project.id).unwrap();
    assert_claim_stable(&claimed.info, &later);
}

#[tokio::test(start_paused = true)]
async fn unrelated_spend_revokes_the_pledge() {
    let f = funded_project().await;
    let mut sub = f.engine.subscribe();
    let spender = unrelated_tx(&[outpoint(1)]);
    f.a.set_spent(outpoint(1), spender.clone());
    f.b.set_spent(outpoint(1), spender.clone());

    f.engine.on_new_block();
    settle(&f.engine).await;

    let snap = f.engine.snapshot(&f.project.id).unwrap();
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.value_pledged, 0);
    assert!(snap.open.is_empty());
    assert!(snap.claimed.is_empty());
    assert_eq!(snap.info.claimed_by, None);

    let revoked = drain(&mut sub).into_iter().any(|e| {
        matches!(e, StateEvent::PledgeRevoked { key, by, .. } if key == f.key && by == spender.txid)
    });
    assert!(revoked, "expected a revocation event");
}

#[tokio::test(start_paused = true)]
async fn disagreeing_sources_keep_the_last_verdict() {
    let f = funded_project().await;
    f.b.set_spent(outpoint(1), unrelated_tx(&[outpoint(1)]));

    f.engine.on_new_block();
    settle(&f.engine).await;

    let snap = f.engine.snapshot(&f.project.id).unwrap();
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.value_pledged, GOAL);
    assert_eq!(snap.open.len(), 1);
    assert_eq!(
        snap.check.as_ref().and_then(|c| c.error_kind()),
        Some(ErrorKind::InconsistentAnswers)
    );

    // Disagreement is not retried on a timer.
    let passes = f.engine.passes_started();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(f.engine.passes_started(), passes);
}

#[tokio::test(start_paused = true)]
async fn next_clean_pass_clears_the_error() {
    let f = funded_project().await;
    f.b.set_spent(outpoint(1), unrelated_tx(&[outpoint(1)]));
    f.engine.on_new_block();
    settle(&f.engine).await;
    assert!(f.engine.check_status(&f.project.id).unwrap().is_error());

    f.b.set_unspent(outpoint(1), Some(GOAL));
    f.engine.on_new_block();
    settle(&f.engine).await;
    assert!(!f.engine.check_status(&f.project.id).unwrap().is_error());
}

#[tokio::test(start_paused = true)]
async fn declared_value_mismatch_is_advisory() {
    let a = MockSource::named("a");
    a.set_unspent(outpoint(1), Some(GOAL - 1));
    let engine = engine_with(&[&a], None);
    let project = project_with_goal(GOAL);
    engine.track_project(project.clone());
    engine
        .ingest_pledge(pledge_for(&project, &[outpoint(1)], GOAL), PledgeOrigin::Local)
        .unwrap();
    settle(&engine).await;

    let snap = engine.snapshot(&project.id).unwrap();
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.value_pledged, GOAL);
    assert_eq!(
        snap.check.as_ref().and_then(|c| c.error_kind()),
        Some(ErrorKind::InputValueMismatch)
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_pledge_is_rejected_up_front() {
    let a = MockSource::named("a");
    let engine = engine_with(&[&a], None);
    let project = project_with_goal(GOAL);
    engine.track_project(project.clone());
    settle(&engine).await;

    let mut pledge = pledge_for(&project, &[outpoint(1)], GOAL);
    pledge.transactions[0].outputs.clear();
    let err = engine.ingest_pledge(pledge, PledgeOrigin::Local).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedPledge);
    assert_eq!(engine.snapshot(&project.id).unwrap().pending, 0);
    assert_eq!(a.calls(), 0);
}

// ─────────────────────────────────────────────────────────
// Retry, reset, removal
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unavailable_source_is_retried_after_backoff() {
    let f = funded_project().await;
    f.a.set_failing(true);
    let base = f.engine.passes_started();

    f.engine.refresh(&f.project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.engine.passes_started(), base + 1);
    assert_eq!(
        f.engine.check_status(&f.project.id).unwrap().error_kind(),
        Some(ErrorKind::SourceUnavailable)
    );
    // A failed pass leaves the verdict where it was.
    assert_eq!(f.engine.state_info(&f.project.id).unwrap().value_pledged, GOAL);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.engine.passes_started(), base + 2);

    f.a.set_failing(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(f.engine.passes_started(), base + 3);
    assert!(!f.engine.check_status(&f.project.id).unwrap().is_error());
    settle(&f.engine).await;
}

#[tokio::test(start_paused = true)]
async fn reset_reverifies_a_claimed_project() {
    let f = funded_project().await;
    let claim = settlement_tx(&f.project, &[outpoint(1)]);
    f.a.set_spent(outpoint(1), claim.clone());
    f.b.set_spent(outpoint(1), claim.clone());
    f.engine.on_new_block();
    settle(&f.engine).await;

    f.engine.reset_project(&f.project.id).unwrap();
    let reset = f.engine.state_info(&f.project.id).unwrap();
    assert_eq!(reset.state, ProjectState::Pending);
    assert_eq!(reset.claimed_by, None);

    settle(&f.engine).await;
    let info = f.engine.state_info(&f.project.id).unwrap();
    assert_eq!(info.state, ProjectState::Claimed);
    assert_eq!(info.claimed_by, Some(claim.txid));
}

#[tokio::test(start_paused = true)]
async fn untracking_mid_pass_discards_the_result() {
    let f = funded_project().await;
    f.a.set_delay(Duration::from_millis(100));
    let mut sub = f.engine.subscribe();

    f.engine.refresh(&f.project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(f.engine.untrack_project(&f.project.id));
    settle(&f.engine).await;

    assert!(f.engine.snapshot(&f.project.id).is_none());
    let events = drain(&mut sub);
    assert!(matches!(events.last(), Some(StateEvent::ProjectRemoved { .. })));
    assert!(f.engine.reset_project(&f.project.id).is_err());
}

#[tokio::test(start_paused = true)]
async fn retracking_mid_pass_ignores_the_old_pass() {
    let f = funded_project().await;
    let claim = settlement_tx(&f.project, &[outpoint(1)]);
    f.a.set_spent(outpoint(1), claim.clone());
    f.b.set_spent(outpoint(1), claim);
    f.a.set_delay(Duration::from_millis(100));

    f.engine.refresh(&f.project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(f.engine.untrack_project(&f.project.id));
    assert!(f.engine.track_project(f.project.clone()));
    settle(&f.engine).await;

    let snap = f.engine.snapshot(&f.project.id).unwrap();
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.claimed_by, None);
    assert_eq!(snap.info.value_pledged, 0);
    assert!(snap.claimed.is_empty());
    assert_all_snapshot_invariants(&snap);
}

// ─────────────────────────────────────────────────────────
// Status feed
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn feed_pledges_count_only_after_verification() {
    let a = MockSource::named("a");
    a.set_unspent(outpoint(1), Some(400_000));
    let feed = MockFeed::new();
    let engine = engine_with(&[&a], Some(feed.clone() as Arc<dyn StatusFeed>));
    let project = project_with_goal(GOAL);
    engine.track_project(project.clone());
    settle(&engine).await;

    let good = pledge_for(&project, &[outpoint(1)], 400_000);
    let mut bad = pledge_for(&project, &[outpoint(2)], 100_000);
    bad.transactions[0].inputs.clear();
    feed.set_status(ProjectStatus {
        project_id: project.id.clone(),
        timestamp: 1_700_000_100,
        value_pledged_so_far: 500_000,
        pledges: vec![good.clone(), bad],
        // A claim hint is only a reason to look.
        claimed_by: Some(settlement_tx(&project, &[outpoint(1)]).txid),
    });

    engine.refresh(&project.id).await.unwrap();
    settle(&engine).await;

    let snap = engine.snapshot(&project.id).unwrap();
    assert_eq!(feed.calls(), 1);
    assert_eq!(snap.info.state, ProjectState::Open);
    assert_eq!(snap.info.value_pledged, 400_000);
    assert_eq!(snap.open.len(), 1);
    assert_eq!(snap.open[0].key(), good.key());
    assert_eq!(snap.info.claimed_by, None);
}

#[tokio::test(start_paused = true)]
async fn unknown_to_feed_surfaces_not_found() {
    let a = MockSource::named("a");
    let feed = MockFeed::new();
    let engine = engine_with(&[&a], Some(feed as Arc<dyn StatusFeed>));
    let project = project_with_goal(GOAL);
    engine.track_project(project.clone());
    settle(&engine).await;
    let passes = engine.passes_started();

    let err = engine.refresh(&project.id).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::Feed(FeedError::NotFound(_))));
    settle(&engine).await;

    assert_eq!(engine.passes_started(), passes);
    assert_eq!(
        engine.check_status(&project.id).unwrap().error_kind(),
        Some(ErrorKind::NotFound)
    );
    assert_eq!(engine.state_info(&project.id).unwrap().state, ProjectState::Open);
}

#[tokio::test(start_paused = true)]
async fn refreshing_an_untracked_project_fails() {
    let a = MockSource::named("a");
    let engine = engine_with(&[&a], None);
    let err = engine
        .refresh(&project_with_goal(GOAL).id)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcilerError::UnknownProject(_)));
}

// ─────────────────────────────────────────────────────────
// Wallet and mirrors
// ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn wallet_revocation_triggers_a_pass() {
    let f = funded_project().await;
    let wallet = MockWallet::new();
    wallet.hold_pledge(f.pledge.clone());
    f.engine.attach_wallet(wallet.clone());
    let passes = f.engine.passes_started();

    let spender = unrelated_tx(&[outpoint(1)]);
    f.a.set_spent(outpoint(1), spender.clone());
    f.b.set_spent(outpoint(1), spender);
    wallet.revoke(&f.project.id);
    settle(&f.engine).await;

    assert_eq!(f.engine.passes_started(), passes + 1);
    let info = f.engine.state_info(&f.project.id).unwrap();
    assert_eq!(info.value_pledged, 0);
}

#[tokio::test(start_paused = true)]
async fn mirrors_track_engine_state() {
    let a = MockSource::named("a");
    a.set_unspent(outpoint(1), Some(300_000));
    a.set_unspent(outpoint(2), Some(200_000));
    let engine = engine_with(&[&a], None);
    let project = project_with_goal(GOAL);
    engine.track_project(project.clone());
    settle(&engine).await;

    let affinity = Handle::current();
    let states = engine.mirror_project_states(&affinity);
    let total = engine.mirror_total_pledged(&project.id, &affinity);
    let open = engine.mirror_open_pledges(&project.id, &affinity);
    let claimed = engine.mirror_claimed_pledges(&project.id, &affinity);
    let checks = engine.mirror_check_statuses(&affinity);
    assert_eq!(states.get()[&project.id].state, ProjectState::Open);
    assert_eq!(total.get(), 0);

    for n in [1, 2] {
        let value = if n == 1 { 300_000 } else { 200_000 };
        engine
            .ingest_pledge(pledge_for(&project, &[outpoint(n)], value), PledgeOrigin::Local)
            .unwrap();
    }
    settle(&engine).await;

    assert_eq!(total.get(), 500_000);
    let open_now = open.get();
    assert_eq!(open_now.len(), 2);
    assert!(open_now[0].timestamp >= open_now[1].timestamp);
    assert!(claimed.get().is_empty());
    assert!(!checks.get()[&project.id].is_error());

    engine.untrack_project(&project.id);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(states.get().is_empty());
    assert_eq!(total.get(), 0);
}
