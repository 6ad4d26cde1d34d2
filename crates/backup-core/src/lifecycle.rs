//! Snapshot creation, readiness wait and two-phase reclaim.
//!
//! Reclaim flips the bound content to `deletionPolicy: Delete` first and
//! only then deletes the snapshot, so the storage goes away together with
//! the snapshot and never before the flip is confirmed.

use std::sync::Arc;
use std::time::Duration;

use backup_common::{
    ClientError, LabelSelector, NamespacedRef, PersistentVolumeClaim, ResourceClient,
    ResourceKind, Scope, VolumeSnapshot, CLAIM_BOUND_PHASE,
};
use serde_json::json;
use tracing::{info, instrument};

use crate::readiness::{self, RetryPolicy};

pub const CLAIM_PHASE_JSON_PATH: &str = "{.status.phase}";
use crate::retention::LABEL_TYPE;
use crate::{BackupError, ReclaimStage, Result};

/// References of every snapshot this tool created in `scope`, sorted by
/// namespace and name ignoring case.
pub async fn list_managed(client: &dyn ResourceClient, scope: &Scope) -> Result<Vec<NamespacedRef>> {
    let selector = LabelSelector::new().exists(LABEL_TYPE);
    let mut refs: Vec<NamespacedRef> = client
        .list_snapshots(scope, &selector)
        .await?
        .iter()
        .map(VolumeSnapshot::reference)
        .collect();
    refs.sort();
    Ok(refs)
}

pub struct SnapshotLifecycleController {
    client: Arc<dyn ResourceClient>,
    retry: RetryPolicy,
    dry_run: bool,
}

impl SnapshotLifecycleController {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
            dry_run: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn client(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    /// Submit the snapshot. In dry-run mode the object is only logged and
    /// returned unchanged.
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.reference()))]
    pub async fn create(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        if self.dry_run {
            let rendered = serde_json::to_string_pretty(snapshot).map_err(ClientError::from)?;
            info!("Skipping snapshot creation - dry run mode is active:\n{rendered}");
            return Ok(snapshot.clone());
        }

        let created = self.client.create_snapshot(snapshot).await?;
        info!(class = ?created.spec.volume_snapshot_class_name, "Created snapshot");
        Ok(created)
    }

    /// Number of attempts it took, see [`readiness::wait_until_ready`].
    pub async fn wait_until_ready(&self, snapshot: &NamespacedRef, timeout: Duration) -> Result<u32> {
        readiness::wait_until_ready(self.client.as_ref(), snapshot, timeout, &self.retry).await
    }

    /// Two-phase reclaim: resolve the bound content, switch it to the
    /// `Delete` policy, then delete the snapshot. Nothing is deleted when
    /// either of the first two steps fails. With `wait` the call returns
    /// once the snapshot is gone.
    #[instrument(skip(self), fields(snapshot = %snapshot))]
    pub async fn prune(&self, snapshot: &NamespacedRef, wait: bool) -> Result<()> {
        let abort = |stage| {
            move |source: ClientError| BackupError::ReclaimAborted {
                snapshot: snapshot.clone(),
                stage,
                source,
            }
        };

        let vs = self
            .client
            .get_snapshot(&snapshot.namespace, &snapshot.name)
            .await
            .map_err(abort(ReclaimStage::ResolveContent))?;
        let content = vs
            .bound_content_name()
            .ok_or_else(|| BackupError::Unbound(snapshot.clone()))?;

        if self.dry_run {
            info!(content, "Skipping prune - dry run mode is active");
            return Ok(());
        }

        self.client
            .patch(
                ResourceKind::VolumeSnapshotContent,
                None,
                content,
                &json!({"spec": {"deletionPolicy": "Delete"}}),
            )
            .await
            .map_err(abort(ReclaimStage::PatchDeletionPolicy))?;
        info!(content, "Set deletionPolicy=Delete on bound content");

        self.client
            .delete(
                ResourceKind::VolumeSnapshot,
                Some(&snapshot.namespace),
                &snapshot.name,
                wait,
            )
            .await?;
        info!(wait, "Deleted snapshot");
        Ok(())
    }

    /// Restore `snapshot` into a new claim `pvc_name` in the snapshot's
    /// namespace, sized by the snapshot's restore size. With `wait` the call
    /// returns once the claim is bound. In dry-run mode the claim is only
    /// logged and returned.
    #[instrument(skip(self), fields(snapshot = %snapshot))]
    pub async fn restore(
        &self,
        snapshot: &NamespacedRef,
        pvc_name: &str,
        storage_class: Option<String>,
        wait: Option<Duration>,
    ) -> Result<PersistentVolumeClaim> {
        let vs = self
            .client
            .get_snapshot(&snapshot.namespace, &snapshot.name)
            .await?;
        let size = vs
            .restore_size()
            .ok_or_else(|| BackupError::RestorePrecondition {
                snapshot: snapshot.clone(),
                reason: "status.restoreSize is not set".to_string(),
            })?;

        let claim = PersistentVolumeClaim::from_snapshot(
            &snapshot.namespace,
            pvc_name,
            &snapshot.name,
            size,
            storage_class.filter(|class| !class.is_empty()),
        );

        if self.dry_run {
            let rendered = serde_json::to_string_pretty(&claim).map_err(ClientError::from)?;
            info!("Skipping restore - dry run mode is active:\n{rendered}");
            return Ok(claim);
        }

        let mut created = self.client.create_claim(&claim).await?;
        info!(pvc = pvc_name, size, "Created claim from snapshot");

        if let Some(timeout) = wait {
            self.client
                .wait_for_condition(
                    ResourceKind::PersistentVolumeClaim,
                    Some(&snapshot.namespace),
                    pvc_name,
                    CLAIM_PHASE_JSON_PATH,
                    CLAIM_BOUND_PHASE,
                    timeout,
                )
                .await?;
            info!(pvc = pvc_name, "Claim is bound");
            created
                .status
                .get_or_insert_with(Default::default)
                .phase = Some(CLAIM_BOUND_PHASE.to_string());
        }
        Ok(created)
    }

    pub async fn list_managed(&self, scope: &Scope) -> Result<Vec<NamespacedRef>> {
        list_managed(self.client.as_ref(), scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryClient, Operation};
    use backup_common::{DeletionPolicy, Labels};

    fn snapshot(ns: &str, name: &str, managed: bool) -> VolumeSnapshot {
        let mut labels = Labels::new();
        if managed {
            labels.insert(LABEL_TYPE.to_string(), "cronjob".to_string());
        }
        VolumeSnapshot::from_pvc(ns, name, "data", None, labels, Default::default())
    }

    #[tokio::test]
    async fn test_dry_run_create_does_not_touch_cluster() {
        let client = Arc::new(InMemoryClient::new());
        let controller = SnapshotLifecycleController::new(client.clone()).dry_run(true);

        let vs = snapshot("ns", "data-1", true);
        let returned = controller.create(&vs).await.unwrap();

        assert_eq!(returned, vs);
        assert!(client.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_flips_policy_then_deletes() {
        let client = Arc::new(InMemoryClient::new().with_deletion_policy(DeletionPolicy::Retain));
        let controller = SnapshotLifecycleController::new(client.clone());
        let created = controller.create(&snapshot("ns", "data-1", true)).await.unwrap();
        let content = created.bound_content_name().unwrap().to_string();
        client.clear_calls().await;

        controller.prune(&created.reference(), true).await.unwrap();

        assert_eq!(
            client.operations().await,
            vec![Operation::GetSnapshot, Operation::Patch, Operation::Delete]
        );
        assert!(client.snapshot("ns", "data-1").await.is_none());
        assert!(client.content(&content).await.is_none());
    }

    #[tokio::test]
    async fn test_prune_aborts_when_patch_fails() {
        let client = Arc::new(InMemoryClient::new());
        let controller = SnapshotLifecycleController::new(client.clone());
        let created = controller.create(&snapshot("ns", "data-1", true)).await.unwrap();
        client.fail_next(Operation::Patch, 1).await;
        client.clear_calls().await;

        let err = controller.prune(&created.reference(), false).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ReclaimAborted {
                stage: ReclaimStage::PatchDeletionPolicy,
                ..
            }
        ));
        assert!(!client.operations().await.contains(&Operation::Delete));
        assert!(client.snapshot("ns", "data-1").await.is_some());
    }

    #[tokio::test]
    async fn test_prune_missing_or_unbound_snapshot() {
        let client = Arc::new(InMemoryClient::new());
        let controller = SnapshotLifecycleController::new(client.clone());

        let err = controller
            .prune(&NamespacedRef::new("ns", "missing"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::ReclaimAborted {
                stage: ReclaimStage::ResolveContent,
                ..
            }
        ));

        client.insert_snapshot(snapshot("ns", "unbound", true)).await;
        let err = controller
            .prune(&NamespacedRef::new("ns", "unbound"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Unbound(_)));
        assert!(!client.operations().await.contains(&Operation::Patch));
    }

    #[tokio::test]
    async fn test_list_managed_sorted() {
        let client = Arc::new(InMemoryClient::new());
        for (ns, name, managed) in [
            ("team-b", "data-1", true),
            ("Team-A", "data-2", true),
            ("team-a", "Data-1", true),
            ("team-a", "foreign", false),
        ] {
            client.insert_snapshot(snapshot(ns, name, managed)).await;
        }
        let controller = SnapshotLifecycleController::new(client.clone());

        let all = controller.list_managed(&Scope::AllNamespaces).await.unwrap();
        let rendered: Vec<String> = all.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["team-a/Data-1", "Team-A/data-2", "team-b/data-1"]);

        let one = controller
            .list_managed(&Scope::Namespace("team-b".to_string()))
            .await
            .unwrap();
        assert_eq!(one, vec![NamespacedRef::new("team-b", "data-1")]);
    }

    #[tokio::test]
    async fn test_restore_creates_bound_claim() {
        let client = Arc::new(InMemoryClient::new().with_restore_size("5Gi"));
        let controller = SnapshotLifecycleController::new(client.clone());
        let created = controller.create(&snapshot("ns", "data-1", true)).await.unwrap();
        client.clear_calls().await;

        let claim = controller
            .restore(
                &created.reference(),
                "data-restored",
                Some("standard".to_string()),
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert_eq!(
            client.operations().await,
            vec![
                Operation::GetSnapshot,
                Operation::CreateClaim,
                Operation::WaitForCondition
            ]
        );
        assert_eq!(claim.phase(), Some(CLAIM_BOUND_PHASE));
        let stored = client.claim("ns", "data-restored").await.unwrap();
        assert_eq!(stored.source_snapshot(), Some("data-1"));
        assert_eq!(stored.spec.resources.requests["storage"], "5Gi");
        assert_eq!(stored.spec.storage_class_name.as_deref(), Some("standard"));
    }

    #[tokio::test]
    async fn test_restore_wait_fails_for_unready_snapshot() {
        let client = Arc::new(InMemoryClient::new().with_ready_on_create(false));
        let controller = SnapshotLifecycleController::new(client.clone());
        let created = controller.create(&snapshot("ns", "data-1", true)).await.unwrap();

        // without waiting the pending claim is returned as is
        let claim = controller
            .restore(&created.reference(), "pending", None, None)
            .await
            .unwrap();
        assert_eq!(claim.phase(), Some("Pending"));

        let err = controller
            .restore(&created.reference(), "waited", None, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackupError::Client(ClientError::Timeout { .. })),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn test_restore_dry_run_and_preconditions() {
        let client = Arc::new(InMemoryClient::new());
        client.insert_snapshot(snapshot("ns", "no-size", true)).await;
        let controller = SnapshotLifecycleController::new(client.clone()).dry_run(true);

        let err = controller
            .restore(&NamespacedRef::new("ns", "no-size"), "restored", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::RestorePrecondition { .. }), "got {err}");

        let err = controller
            .restore(&NamespacedRef::new("ns", "missing"), "restored", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Client(ref e) if e.is_not_found()), "got {err}");

        let created = SnapshotLifecycleController::new(client.clone())
            .create(&snapshot("ns", "data-1", true))
            .await
            .unwrap();
        client.clear_calls().await;
        let claim = controller
            .restore(&created.reference(), "restored", Some(String::new()), None)
            .await
            .unwrap();
        assert_eq!(claim.spec.resources.requests["storage"], "1Gi");
        assert_eq!(claim.spec.storage_class_name, None);
        assert_eq!(client.operations().await, vec![Operation::GetSnapshot]);
        assert!(client.claim("ns", "restored").await.is_none());
    }
}
