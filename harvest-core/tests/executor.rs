mod common;

use std::time::Duration;

use tempfile::tempdir;

use common::{build_executor_parts, FakePortal};
use harvest_core::engine::{EngineError, StepExecutor, StepRequest};

fn executor(root: &std::path::Path) -> StepExecutor {
    let (catalog, detector, run_log, config) = build_executor_parts(root);
    StepExecutor::new(catalog, detector, run_log, config.retry)
}

#[tokio::test(start_paused = true)]
async fn optional_step_exhausts_tiers_without_teardown() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    let mut portal = FakePortal::new("https://portal.test/detail/7/history")
        .with_failing("data-tab");
    let (log, closes) = portal.handles();

    let err = executor
        .run(&mut portal, &StepRequest::new("open data tab"))
        .await
        .unwrap_err();
    match err {
        EngineError::StepFailed {
            attempts, fatal, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(!fatal);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(*closes.borrow(), 0, "optional failures keep the session");
    // A reload between every pair of tiers, none after the last.
    let reloads = log.borrow().iter().filter(|e| *e == "reload").count();
    assert_eq!(reloads, 2);
}

#[tokio::test(start_paused = true)]
async fn unstable_step_gets_a_single_tier() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    let mut portal = FakePortal::new("https://portal.test/search/list")
        .with_failing("queue-search");
    let (log, _) = portal.handles();

    let err = executor
        .run(
            &mut portal,
            &StepRequest::new("search for queue")
                .unstable()
                .with_keys("Q"),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::StepFailed { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!log.borrow().iter().any(|e| e == "reload"));
}

#[tokio::test(start_paused = true)]
async fn expected_url_mismatch_forces_navigation() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    let mut portal = FakePortal::new("https://portal.test/somewhere/else");
    let (log, _) = portal.handles();

    let outcome = executor
        .run(
            &mut portal,
            &StepRequest::new("switch to list view")
                .expect_url("https://portal.test/search/list"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.reloads, 1);
    assert_eq!(outcome.attempts, 1);
    let entries = log.borrow();
    assert!(entries.contains(&"goto:https://portal.test/search/list".to_string()));
    assert!(entries.contains(&"click:list-view".to_string()));
}

#[tokio::test(start_paused = true)]
async fn reload_provoked_dialog_is_cleared_before_next_tier() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    // The element misses once; the reload that follows pops a dialog.
    let mut portal = FakePortal::new("https://portal.test/search/list")
        .with_failing_times("more-menu", 1)
        .with_dialog_on_reload("promo-dialog");
    let (log, _) = portal.handles();

    let outcome = executor
        .run(&mut portal, &StepRequest::new("open more menu"))
        .await
        .unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.interferences_cleared, 1);

    let entries = log.borrow();
    let reload = entries.iter().position(|e| e == "reload").unwrap();
    let dismissed = entries
        .iter()
        .position(|e| e == "click:promo-dialog")
        .unwrap();
    let clicked = entries.iter().position(|e| e == "click:more-menu").unwrap();
    assert!(reload < dismissed, "the dialog only exists after the reload");
    assert!(dismissed < clicked, "the next tier must start on a clean page");
}

#[tokio::test(start_paused = true)]
async fn pre_step_pause_runs_before_the_attempt() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    let mut portal = FakePortal::new("https://portal.test/detail/7/history");

    let started = tokio::time::Instant::now();
    let outcome = executor
        .run(&mut portal, &StepRequest::new("open data tab").pause_secs(3))
        .await
        .unwrap();
    assert_eq!(outcome.attempts, 1);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn success_after_retry_reports_attempts() {
    let dir = tempdir().unwrap();
    let executor = executor(dir.path());
    // The dialog blocks nothing in the fake, but a present marker lets
    // the sweep count a recovery while the click itself succeeds.
    let mut portal = FakePortal::new("https://portal.test/detail/7/history")
        .with_dialog("guide-dialog");

    let outcome = executor
        .run(&mut portal, &StepRequest::new("open data tab"))
        .await
        .unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.interferences_cleared, 1);
}
