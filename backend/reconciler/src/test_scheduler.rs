use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, PledgeOrigin};
use crate::testutil::{engine_with, outpoint, pledge_for, project_with_goal, settle, MockSource};
use crate::types::{Project, ProjectState};

/// One source, one project holding one verified pledge.
async fn setup(delay: Duration) -> (Arc<Engine>, Arc<MockSource>, Project) {
    let source = MockSource::named("a");
    source.set_unspent(outpoint(1), Some(5_000));
    let engine = engine_with(&[&source], None);
    let project = project_with_goal(10_000);
    engine.track_project(project.clone());
    engine
        .ingest_pledge(pledge_for(&project, &[outpoint(1)], 5_000), PledgeOrigin::Local)
        .unwrap();
    settle(&engine).await;
    source.set_delay(delay);
    (engine, source, project)
}

#[tokio::test(start_paused = true)]
async fn chain_tip_burst_runs_one_pass() {
    let (engine, source, _) = setup(Duration::ZERO).await;
    let passes = engine.passes_started();

    for _ in 0..4 {
        engine.on_new_block();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    settle(&engine).await;

    assert_eq!(engine.passes_started(), passes + 1);
    assert_eq!(source.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn tips_further_apart_than_the_window_each_run() {
    let (engine, _, _) = setup(Duration::ZERO).await;
    let passes = engine.passes_started();

    engine.on_new_block();
    settle(&engine).await;
    engine.on_new_block();
    settle(&engine).await;

    assert_eq!(engine.passes_started(), passes + 2);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_skips_the_debounce_window() {
    let (engine, _, project) = setup(Duration::ZERO).await;
    let passes = engine.passes_started();

    engine.refresh(&project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(engine.passes_started(), passes + 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_during_a_pass_runs_exactly_one_follow_up() {
    let (engine, source, project) = setup(Duration::from_millis(100)).await;
    let passes = engine.passes_started();

    // Chain-tip pass runs from 50ms (after the debounce) to 150ms.
    engine.on_new_block();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(engine.passes_started(), passes + 1);

    engine.refresh(&project.id).await.unwrap();
    engine.refresh(&project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(engine.passes_started(), passes + 1, "follow-up must wait");

    settle(&engine).await;
    assert_eq!(engine.passes_started(), passes + 2);
    assert_eq!(engine.passes_completed(), engine.passes_started());
    assert_eq!(source.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn different_projects_verify_in_parallel() {
    let source = MockSource::named("a");
    source.set_unspent(outpoint(1), Some(5_000));
    source.set_unspent(outpoint(2), Some(5_000));
    let engine = engine_with(&[&source], None);
    let first = project_with_goal(10_000);
    let second = project_with_goal(20_000);
    for (project, n) in [(&first, 1), (&second, 2)] {
        engine.track_project(project.clone());
        engine
            .ingest_pledge(pledge_for(project, &[outpoint(n)], 5_000), PledgeOrigin::Local)
            .unwrap();
    }
    settle(&engine).await;
    source.set_delay(Duration::from_millis(100));

    engine.refresh(&first.id).await.unwrap();
    engine.refresh(&second.id).await.unwrap();
    settle(&engine).await;

    assert_eq!(source.max_in_flight(), 2);
    for project in [&first, &second] {
        let info = engine.state_info(&project.id).unwrap();
        assert_eq!(info.state, ProjectState::Open);
        assert_eq!(info.value_pledged, 5_000);
    }
}

#[tokio::test(start_paused = true)]
async fn retry_backoff_doubles_up_to_the_cap() {
    let (engine, source, project) = setup(Duration::ZERO).await;
    source.set_failing(true);
    let passes = engine.passes_started();

    // Failures at 0s, 1s, 3s, 7s, 11s: back-off 1, 2, 4, then capped at 4.
    engine.refresh(&project.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(11_500)).await;
    assert_eq!(engine.passes_started(), passes + 5);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(engine.passes_started(), passes + 6);

    engine.untrack_project(&project.id);
    settle(&engine).await;
    assert!(engine.is_idle());
}

#[tokio::test(start_paused = true)]
async fn untracked_projects_ignore_triggers() {
    let (engine, source, project) = setup(Duration::ZERO).await;
    engine.untrack_project(&project.id);
    let calls = source.calls();

    engine.on_new_block();
    assert!(engine.refresh(&project.id).await.is_err());
    settle(&engine).await;

    assert_eq!(source.calls(), calls);
}
