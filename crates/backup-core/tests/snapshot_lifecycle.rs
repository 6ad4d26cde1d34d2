use std::sync::Arc;
use std::time::Duration;

use backup_core::common::{DeletionPolicy, NamespacedRef, ResourceClient, Scope, VolumeSnapshot};
use backup_core::retention::{LABEL_DELETE_AFTER, LABEL_RETAIN, LABEL_RETAIN_DAYS, LABEL_TYPE};
use backup_core::*;
use chrono::{TimeZone, Utc};

fn days_config(count: u32) -> LabelConfig {
    LabelConfig {
        kind: "cronjob".to_string(),
        pod: String::new(),
        retain: RetentionPolicy::Days { count },
    }
}

#[tokio::test]
async fn test_prune_never_deletes_before_policy_patch_succeeds() {
    let client = Arc::new(InMemoryClient::new());
    let controller = SnapshotLifecycleController::new(client.clone());
    let vs = VolumeSnapshot::from_pvc("ns", "data-1", "data", None, Default::default(), Default::default());
    let created = controller.create(&vs).await.unwrap();

    // first attempt: patch fails, nothing destructive happens
    client.fail_next(Operation::Patch, 1).await;
    client.clear_calls().await;
    let err = controller.prune(&created.reference(), true).await.unwrap_err();
    assert!(matches!(err, BackupError::ReclaimAborted { .. }));
    assert_eq!(
        client.operations().await,
        vec![Operation::GetSnapshot, Operation::Patch]
    );

    // second attempt: delete comes strictly after a successful patch
    client.clear_calls().await;
    controller.prune(&created.reference(), true).await.unwrap();
    let calls = client.calls().await;
    let ops: Vec<Operation> = calls.iter().map(|c| c.operation).collect();
    assert_eq!(
        ops,
        vec![Operation::GetSnapshot, Operation::Patch, Operation::Delete]
    );
    assert_eq!(
        calls[1].patch,
        Some(serde_json::json!({"spec": {"deletionPolicy": "Delete"}}))
    );
}

#[tokio::test(start_paused = true)]
async fn test_readiness_wait_makes_exactly_three_attempts() {
    let client = Arc::new(InMemoryClient::new());
    client.fail_always(Operation::WaitForCondition).await;
    let controller = SnapshotLifecycleController::new(client.clone());

    let err = controller
        .wait_until_ready(&NamespacedRef::new("ns", "data-1"), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(err.is_soft());
    assert!(err.to_string().contains("3 attempts"), "got {err}");
    assert_eq!(
        client.operations().await,
        vec![Operation::WaitForCondition; 3]
    );
}

#[tokio::test(start_paused = true)]
async fn test_days_policy_end_to_end() {
    let client = Arc::new(InMemoryClient::new().with_deletion_policy(DeletionPolicy::Retain));
    client.add_claim("team-a", "data").await;
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

    let config = BackupConfig {
        namespace: "team-a".to_string(),
        vs_rand: "e2e001".to_string(),
        label: days_config(1),
        ..Default::default()
    };

    // create + wait
    let outcome = BackupJob::new(config, client.clone()).run(now).await.unwrap();
    assert!(outcome.ready);
    assert_eq!(outcome.labels[LABEL_DELETE_AFTER], "2024-01-11");
    assert_eq!(outcome.labels[LABEL_RETAIN], "days");
    assert_eq!(outcome.labels[LABEL_RETAIN_DAYS], "1");

    // sync labels onto the content
    let syncer = LabelSyncer::new(client.clone());
    let snapshot = outcome.snapshot.clone();
    assert!(syncer.sync(&snapshot.namespace, &snapshot.name).await.unwrap().applied);
    let vs = client.get_snapshot(&snapshot.namespace, &snapshot.name).await.unwrap();
    let content_name = vs.bound_content_name().unwrap().to_string();
    let content = client.get_content(&content_name).await.unwrap();
    assert_eq!(content.metadata.labels[LABEL_DELETE_AFTER], "2024-01-11");
    assert_eq!(content.metadata.labels[LABEL_TYPE], "cronjob");
    assert!(!syncer.sync(&snapshot.namespace, &snapshot.name).await.unwrap().applied);

    // listed as managed
    let managed = list_managed(client.as_ref(), &Scope::AllNamespaces).await.unwrap();
    assert_eq!(managed, vec![snapshot.clone()]);

    // prune: content flipped to Delete first, so it goes away with the snapshot
    SnapshotLifecycleController::new(client.clone())
        .prune(&snapshot, true)
        .await
        .unwrap();
    assert!(client.snapshot(&snapshot.namespace, &snapshot.name).await.is_none());
    assert!(client.content(&content_name).await.is_none());
}

#[tokio::test]
async fn test_delete_after_sweep_uses_two_phase_reclaim() {
    let client = Arc::new(InMemoryClient::new());
    client.add_claim("ns", "data").await;
    let created_at = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();

    let config = BackupConfig {
        namespace: "ns".to_string(),
        vs_rand: "sweep1".to_string(),
        label: days_config(1),
        wait_until_ready: false,
        ..Default::default()
    };
    let outcome = BackupJob::new(config, client.clone()).run(created_at).await.unwrap();

    let sweeper = ExpirySweeper::new(SnapshotLifecycleController::new(client.clone()));

    // delete-after=2024-01-11 is not strictly before 2024-01-11
    let report = sweeper
        .sweep(chrono::NaiveDate::from_ymd_opt(2024, 1, 11).unwrap())
        .await
        .unwrap();
    assert_eq!(report.unchanged, 1);

    client.clear_calls().await;
    let report = sweeper
        .sweep(chrono::NaiveDate::from_ymd_opt(2024, 1, 12).unwrap())
        .await
        .unwrap();
    assert_eq!(report.changed, 1);
    assert!(client
        .snapshot(&outcome.snapshot.namespace, &outcome.snapshot.name)
        .await
        .is_none());

    let ops = client.operations().await;
    let patch = ops.iter().position(|op| *op == Operation::Patch).unwrap();
    let delete = ops.iter().position(|op| *op == Operation::Delete).unwrap();
    assert!(patch < delete);
}

#[tokio::test(start_paused = true)]
async fn test_backup_then_restore_into_new_claim() {
    let client = Arc::new(InMemoryClient::new().with_restore_size("2Gi"));
    client.add_claim("ns", "data").await;
    let config = BackupConfig {
        namespace: "ns".to_string(),
        vs_rand: "rst001".to_string(),
        ..Default::default()
    };
    let outcome = BackupJob::new(config, client.clone())
        .run(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap())
        .await
        .unwrap();

    let claim = SnapshotLifecycleController::new(client.clone())
        .restore(&outcome.snapshot, "data-restored", None, Some(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(claim.reference(), NamespacedRef::new("ns", "data-restored"));
    assert_eq!(claim.source_snapshot(), Some(outcome.snapshot.name.as_str()));
    assert_eq!(claim.spec.resources.requests["storage"], "2Gi");

    // a second restore into the same claim name is refused by the cluster
    let err = SnapshotLifecycleController::new(client.clone())
        .restore(&outcome.snapshot, "data-restored", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BackupError::Client(backup_core::common::ClientError::Conflict { .. })
    ));
}
