//! Read-only checks against whatever cluster the current kubeconfig points
//! at. Skipped when kubectl or the snapshot API is unavailable.

use backup_core::common::{ResourceClient, ResourceKind, Scope};
use backup_core::{list_managed, require_kubectl, KubectlClient};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_list_managed_snapshots() {
    require_kubectl!();

    let client = KubectlClient::new();
    let refs = list_managed(&client, &Scope::AllNamespaces).await.unwrap();

    let mut sorted = refs.clone();
    sorted.sort();
    assert_eq!(refs, sorted);
}

#[tokio::test]
#[serial]
async fn test_missing_objects() {
    require_kubectl!();

    let client = KubectlClient::new();
    let namespace = client
        .current_namespace()
        .await
        .unwrap_or_else(|| "default".to_string());

    let exists = client
        .exists(
            ResourceKind::VolumeSnapshot,
            Some(&namespace),
            "backup-ns-this-snapshot-does-not-exist",
        )
        .await
        .unwrap();
    assert!(!exists);

    let err = client
        .get_content("backup-ns-this-content-does-not-exist")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {err}");
}
