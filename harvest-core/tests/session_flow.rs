mod common;

use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use tempfile::tempdir;

use common::{
    build_controller, build_controller_with_provider, test_config, FakeFactory, FakePortal,
    FixedCodeProvider,
};
use harvest_core::engine::{CheckpointStore, EngineError, FileInbox, QueueStatus, Target};

fn seed_checkpoint(root: &Path, queue: &str, queues: &[String], targets: &[Target]) {
    let store = CheckpointStore::new(root.join("checkpoints"));
    store.initialize(queues).unwrap();
    store.write_queue(queue, targets).unwrap();
}

fn target(id: &str, completed: bool) -> Target {
    Target {
        id: id.to_string(),
        address: format!("{id} Harbor Way"),
        building: "Pier".to_string(),
        completed,
    }
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_pixel(width, height, Rgb([90u8, 120, 60]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(buffer)
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

#[tokio::test(start_paused = true)]
async fn resume_extracts_only_remaining_targets() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["IndustrialWest"]));
    seed_checkpoint(
        root,
        "IndustrialWest",
        &config.portal.queues,
        &[target("1", true), target("2", false), target("3", false)],
    );
    // Target #1 already has its artifact and all targets have photos.
    std::fs::create_dir_all(root.join("data/IndustrialWest")).unwrap();
    std::fs::write(root.join("data/IndustrialWest/1.csv"), "sentinel").unwrap();
    std::fs::create_dir_all(root.join("images")).unwrap();
    for id in ["1", "2", "3"] {
        std::fs::write(root.join(format!("images/{id}.jpg")), "photo").unwrap();
    }

    let portal = FakePortal::new("about:blank").with_download(
        "export-history",
        root.join("staging/HistoryExport.csv"),
        b"history".to_vec(),
    );
    let (log, closes) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let (mut controller, _run_log) = build_controller(config.clone());
    let metrics = controller.run(&factory).await.unwrap();

    assert_eq!(metrics.targets_completed, 2);
    assert_eq!(metrics.targets_skipped, 1);
    assert_eq!(*closes.borrow(), 1);

    let store = CheckpointStore::new(root.join("checkpoints"));
    let targets = store.load_queue("IndustrialWest").unwrap();
    assert_eq!(targets.len(), 3);
    assert!(targets.iter().all(|t| t.completed));
    assert_eq!(store.load_progress().unwrap()["IndustrialWest"], QueueStatus::Done);

    // The completed target's artifact was not touched or re-fetched.
    assert_eq!(
        std::fs::read_to_string(root.join("data/IndustrialWest/1.csv")).unwrap(),
        "sentinel"
    );
    assert!(root.join("data/IndustrialWest/2.csv").exists());
    assert!(root.join("data/IndustrialWest/3.csv").exists());
    let entries = log.borrow();
    assert!(!entries.iter().any(|e| e.contains("/detail/1/")));
    assert!(entries.iter().any(|e| e == "goto:https://portal.test/detail/2/history"));
}

#[tokio::test(start_paused = true)]
async fn no_data_target_completes_without_export_or_retry() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Q"]));
    seed_checkpoint(root, "Q", &config.portal.queues, &[target("12345", false)]);
    std::fs::create_dir_all(root.join("images")).unwrap();
    std::fs::write(root.join("images/12345.jpg"), "photo").unwrap();

    let portal = FakePortal::new("about:blank")
        .with_marker_when("/detail/12345/history", "no-data");
    let (log, _) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let (mut controller, run_log) = build_controller(config.clone());
    let metrics = controller.run(&factory).await.unwrap();
    assert_eq!(metrics.targets_completed, 1);

    let store = CheckpointStore::new(root.join("checkpoints"));
    assert!(store.load_queue("Q").unwrap()[0].completed);
    assert!(!root.join("data/Q/12345.csv").exists());

    let entries = log.borrow();
    let detail_visits = entries
        .iter()
        .filter(|e| e.contains("/detail/12345/history"))
        .count();
    assert_eq!(detail_visits, 1, "no retry for an explicit no-data target");
    assert!(!entries.iter().any(|e| e == "click:export-history"));

    drop(run_log);
    let jsonl = std::fs::read_to_string(root.join("logs/run.jsonl")).unwrap();
    assert!(jsonl.contains("NoData"));
    assert!(jsonl.contains("12345"));
}

#[tokio::test(start_paused = true)]
async fn oversized_queue_is_flagged_and_never_exported() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Big"]));

    let portal = FakePortal::new("about:blank").with_count_text("1 - 25 of 600");
    let (log, _) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let (mut controller, _run_log) = build_controller(config.clone());
    controller.run(&factory).await.unwrap();

    let store = CheckpointStore::new(root.join("checkpoints"));
    assert_eq!(store.load_progress().unwrap()["Big"], QueueStatus::Oversized);
    assert!(store.load_queue("Big").unwrap().is_empty());
    assert!(!root.join("data/Big.csv").exists());
    let entries = log.borrow();
    assert!(entries.iter().any(|e| e == "type:queue-search:Big"));
    assert!(!entries.iter().any(|e| e == "click:export-btn"));
}

#[tokio::test(start_paused = true)]
async fn fresh_queue_runs_end_to_end() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Fresh"]));

    let baseline = "PropertyID,Property Address,Property Name\n7,1 Pier Rd,Dock A\n8,2 Pier Rd,Dock B\n";
    let portal = FakePortal::new("about:blank")
        .with_count_text("1 - 2 of 2")
        .with_download(
            "start-export",
            root.join("staging/SearchExport.csv"),
            baseline.as_bytes().to_vec(),
        )
        .with_download(
            "export-history",
            root.join("staging/HistoryExport.csv"),
            b"history".to_vec(),
        )
        .with_marker_when("/detail/7/summary", "image-thumb")
        .with_download("image-dl", root.join("staging/photo.png"), png_bytes(1280, 720));
    let (log, closes) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let (mut controller, _run_log) = build_controller(config.clone());
    let metrics = controller.run(&factory).await.unwrap();

    assert_eq!(metrics.targets_completed, 2);
    assert_eq!(metrics.images_stored, 1);
    assert_eq!(*closes.borrow(), 1);

    let store = CheckpointStore::new(root.join("checkpoints"));
    assert_eq!(store.load_progress().unwrap()["Fresh"], QueueStatus::Done);
    let targets = store.load_queue("Fresh").unwrap();
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.completed));

    // Baseline was claimed, augmented and used to seed the checkpoint.
    let baseline_out = std::fs::read_to_string(root.join("data/Fresh.csv")).unwrap();
    assert!(baseline_out.lines().next().unwrap().contains("Property Class"));
    assert!(root.join("data/Fresh/7.csv").exists());
    assert!(root.join("data/Fresh/8.csv").exists());

    // One target had a hero image, the other did not.
    let photo = image::open(root.join("images/7.jpg")).unwrap();
    assert_eq!((photo.width(), photo.height()), (1280, 720));
    assert!(!root.join("images/8.jpg").exists());
    let entries = log.borrow();
    assert!(entries.iter().any(|e| e == "click:image-dl"));
}

#[tokio::test(start_paused = true)]
async fn login_without_challenge_skips_two_factor() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let mut config = test_config(root, &[]);
    config.two_factor.enabled = true;
    let config = Arc::new(config);

    // Every login element is there except the code prompt, the way a
    // remembered device logs in.
    let portal = FakePortal::new("about:blank");
    let (log, closes) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let provider = FixedCodeProvider {
        code: Some("4821".to_string()),
    };
    let (mut controller, _run_log) =
        build_controller_with_provider(config.clone(), Some(Arc::new(provider)));
    controller.run(&factory).await.unwrap();

    let entries = log.borrow();
    assert!(entries.iter().any(|e| e == "click:login-submit"));
    assert!(
        !entries.iter().any(|e| e.starts_with("type:code")),
        "no prompt means no code entry"
    );
    assert_eq!(*closes.borrow(), 1);
}

#[tokio::test(start_paused = true)]
async fn login_with_challenge_submits_the_code() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let mut config = test_config(root, &[]);
    config.two_factor.enabled = true;
    let config = Arc::new(config);

    let portal = FakePortal::new("about:blank").with_dialog("code");
    let (log, _) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let provider = FixedCodeProvider {
        code: Some("4821".to_string()),
    };
    let (mut controller, _run_log) =
        build_controller_with_provider(config.clone(), Some(Arc::new(provider)));
    controller.run(&factory).await.unwrap();

    let entries = log.borrow();
    assert!(entries.iter().any(|e| e == "type:code:4821"));
    assert!(entries.iter().any(|e| e == "click:code-submit"));
}

#[tokio::test(start_paused = true)]
async fn operator_resume_restarts_from_checkpoint() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Q"]));
    seed_checkpoint(root, "Q", &config.portal.queues, &[target("9", true)]);

    // First session dies during login; the second one succeeds.
    let broken = FakePortal::new("about:blank").with_failing("username");
    let healthy = FakePortal::new("about:blank");
    let factory = FakeFactory::new(vec![broken, healthy]);

    // The operator's answer is already waiting in the inbox.
    std::fs::create_dir_all(root.join("signal/inbox")).unwrap();
    std::fs::write(root.join("signal/inbox/001.txt"), "start").unwrap();
    let channel = FileInbox::new(root.join("signal/inbox"), root.join("signal/outbox"));

    let (mut controller, _run_log) = build_controller(config.clone());
    let metrics = controller
        .run_with_recovery(&factory, &channel)
        .await
        .unwrap();
    assert_eq!(metrics.targets_skipped, 1);

    // The abort notified the operator and the cue was consumed.
    assert_eq!(std::fs::read_dir(root.join("signal/outbox")).unwrap().count(), 1);
    assert_eq!(std::fs::read_dir(root.join("signal/inbox")).unwrap().count(), 0);
    let store = CheckpointStore::new(root.join("checkpoints"));
    assert_eq!(store.load_progress().unwrap()["Q"], QueueStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn operator_cancel_stops_the_run() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Q"]));

    let broken = FakePortal::new("about:blank").with_failing("username");
    let factory = FakeFactory::new(vec![broken]);
    std::fs::create_dir_all(root.join("signal/inbox")).unwrap();
    std::fs::write(root.join("signal/inbox/001.txt"), "cancel").unwrap();
    let channel = FileInbox::new(root.join("signal/inbox"), root.join("signal/outbox"));

    let (mut controller, _run_log) = build_controller(config.clone());
    let err = controller
        .run_with_recovery(&factory, &channel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn fatal_login_failure_closes_browser_once() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = Arc::new(test_config(root, &["Q"]));

    let portal = FakePortal::new("about:blank").with_failing("username");
    let (_, closes) = portal.handles();
    let factory = FakeFactory::new(vec![portal]);

    let (mut controller, _run_log) = build_controller(config.clone());
    let err = controller.run(&factory).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(*closes.borrow(), 1, "fatal teardown happens exactly once");

    // Nothing was extracted, so the queue stays pending.
    let store = CheckpointStore::new(root.join("checkpoints"));
    assert_eq!(store.load_progress().unwrap()["Q"], QueueStatus::Pending);
}
