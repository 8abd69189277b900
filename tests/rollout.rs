mod common;

use common::{inspect_fixture, spawn_engine};
use tagwatch::rollout::{RolloutError, RolloutOrchestrator};

#[tokio::test]
async fn successful_rollout_replaces_container_and_drops_backup() {
    let engine = spawn_engine().await;
    engine.add_container(
        "app1",
        "nginx:latest",
        inspect_fixture("abc123", "app1", "nginx:latest"),
    );

    let orchestrator = RolloutOrchestrator::new(engine.client());
    orchestrator.rollout("app1", "nginx:latest").await.unwrap();

    let state = engine.lock();
    assert_eq!(state.containers.len(), 1, "backup must be removed");
    let replacement = &state.containers["app1"];
    assert_eq!(replacement.image_ref, "nginx:latest");

    // The replacement carries the old container's configuration.
    let body = replacement.create_body.as_ref().unwrap();
    assert_eq!(body["Hostname"], "app1");
    assert_eq!(body["Env"][0], "APP_MODE=test");
    assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");

    assert_eq!(state.stops, 1);
    assert_eq!(state.renames, 1);
    assert_eq!(state.creates, 1);
    assert_eq!(state.starts, 1);
    assert_eq!(state.removed_containers.len(), 1);
    assert!(state.removed_containers[0].starts_with("app1_backup_"));
}

#[tokio::test]
async fn failed_create_restores_the_original_container() {
    let engine = spawn_engine().await;
    engine.add_container(
        "app1",
        "nginx:latest",
        inspect_fixture("abc123", "app1", "nginx:latest"),
    );
    engine.fail_create_of("app1");

    let orchestrator = RolloutOrchestrator::new(engine.client());
    let err = orchestrator.rollout("app1", "nginx:latest").await.unwrap_err();
    assert!(matches!(err, RolloutError::Create { .. }));

    let state = engine.lock();
    // Exactly the original container remains, under its original name.
    assert_eq!(state.containers.len(), 1);
    let restored = &state.containers["app1"];
    assert_eq!(restored.inspect["Id"], "abc123");
    assert!(restored.create_body.is_none());
    assert_eq!(state.creates, 0);
}

#[tokio::test]
async fn failed_rollback_rename_force_removes_the_stranded_backup() {
    let engine = spawn_engine().await;
    engine.add_container(
        "app1",
        "nginx:latest",
        inspect_fixture("abc123", "app1", "nginx:latest"),
    );
    // Creation fails, and the rename back to the original name is refused
    // as well, so the backup cannot be restored.
    engine.fail_create_of("app1");
    engine.fail_rename_to("app1");

    let orchestrator = RolloutOrchestrator::new(engine.client());
    let err = orchestrator.rollout("app1", "nginx:latest").await.unwrap_err();
    match err {
        RolloutError::RollbackFailed { name, backup } => {
            assert_eq!(name, "app1");
            assert!(backup.starts_with("app1_backup_"));
        }
        other => panic!("expected RollbackFailed, got {other:?}"),
    }

    let state = engine.lock();
    // The stranded backup was force-removed rather than left behind.
    assert!(state.containers.is_empty());
    assert_eq!(state.removed_containers.len(), 1);
    assert!(state.removed_containers[0].starts_with("app1_backup_"));
}

#[tokio::test]
async fn rollout_of_unknown_container_fails_in_preparation() {
    let engine = spawn_engine().await;
    let orchestrator = RolloutOrchestrator::new(engine.client());

    let err = orchestrator.rollout("ghost", "nginx:latest").await.unwrap_err();
    assert!(matches!(err, RolloutError::Prepare { .. }));

    let state = engine.lock();
    assert_eq!(state.stops, 0);
    assert_eq!(state.renames, 0);
}

#[tokio::test]
async fn rollout_many_reports_per_container_results() {
    let engine = spawn_engine().await;
    engine.add_container(
        "good",
        "nginx:latest",
        inspect_fixture("aaa111", "good", "nginx:latest"),
    );
    engine.add_container(
        "bad",
        "nginx:latest",
        inspect_fixture("bbb222", "bad", "nginx:latest"),
    );
    engine.fail_create_of("bad");

    let orchestrator = RolloutOrchestrator::new(engine.client());
    let names = vec!["good".to_string(), "bad".to_string()];
    let results = orchestrator.rollout_many(&names, "nginx:latest").await;

    assert_eq!(results["good"], true);
    assert_eq!(results["bad"], false);

    let state = engine.lock();
    assert!(state.containers.contains_key("good"));
    assert!(state.containers.contains_key("bad"));
    // The failed one is the restored original.
    assert_eq!(state.containers["bad"].inspect["Id"], "bbb222");
}
