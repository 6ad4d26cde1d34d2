//! Mirrors `backup-ns.sh/` labels from a snapshot onto its bound content so
//! the retention state survives the snapshot being deleted.

use std::sync::Arc;

use backup_common::{Labels, ResourceClient, ResourceKind, Scope};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::lifecycle::list_managed;
use crate::retention::managed_labels;
use crate::sweep::SweepReport;
use crate::{BackupError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub applied: bool,
}

/// What it takes to make the content's managed labels equal the snapshot's.
#[derive(Debug, Default, PartialEq, Eq)]
struct LabelDiff {
    /// Keys missing on the content or holding another value there.
    changed: Labels,
    /// Managed keys the content has and the snapshot no longer does.
    stale: Vec<String>,
}

impl LabelDiff {
    fn compute(snapshot: &Labels, content: &Labels) -> Self {
        let changed = snapshot
            .iter()
            .filter(|(key, value)| content.get(*key) != Some(*value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let stale = content
            .keys()
            .filter(|key| !snapshot.contains_key(*key))
            .cloned()
            .collect();
        Self { changed, stale }
    }

    /// Stale keys alone count as drift, so a label the snapshot lost is
    /// removed from the content even when every remaining key matches.
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.stale.is_empty()
    }
}

pub struct LabelSyncer {
    client: Arc<dyn ResourceClient>,
    dry_run: bool,
}

impl LabelSyncer {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Bring the bound content's managed labels in line with the snapshot.
    /// Stale keys are removed in a first patch, the full managed set is
    /// applied in a second one. Returns `applied: false` when nothing
    /// differed, or in dry-run mode.
    #[instrument(skip(self))]
    pub async fn sync(&self, namespace: &str, snapshot_name: &str) -> Result<SyncResult> {
        let vs = self.client.get_snapshot(namespace, snapshot_name).await?;
        let content_name = vs
            .bound_content_name()
            .ok_or_else(|| BackupError::Unbound(vs.reference()))?;
        let content = self.client.get_content(content_name).await?;

        let wanted = managed_labels(&vs.metadata.labels);
        let current = managed_labels(&content.metadata.labels);
        let diff = LabelDiff::compute(&wanted, &current);

        if diff.is_empty() {
            debug!(content = content_name, "Labels already in sync");
            return Ok(SyncResult { applied: false });
        }

        if self.dry_run {
            info!(
                content = content_name,
                changed = ?diff.changed,
                stale = ?diff.stale,
                "Skipping label sync - dry run mode is active"
            );
            return Ok(SyncResult { applied: false });
        }

        if !diff.stale.is_empty() {
            let removals: Map<String, Value> = diff
                .stale
                .iter()
                .map(|key| (key.clone(), Value::Null))
                .collect();
            self.patch_labels(content_name, Value::Object(removals))
                .await?;
        }

        self.patch_labels(content_name, json!(wanted)).await?;

        info!(
            content = content_name,
            changed = diff.changed.len(),
            removed = diff.stale.len(),
            "Synced labels to content"
        );
        Ok(SyncResult { applied: true })
    }

    /// Sync every managed snapshot in `scope`. A failure on one snapshot is
    /// logged and counted, the sweep carries on.
    #[instrument(skip(self))]
    pub async fn sync_all(&self, scope: &Scope) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for snapshot in list_managed(self.client.as_ref(), scope).await? {
            match self.sync(&snapshot.namespace, &snapshot.name).await {
                Ok(SyncResult { applied: true }) => report.changed += 1,
                Ok(SyncResult { applied: false }) => report.unchanged += 1,
                Err(BackupError::Unbound(_)) => {
                    debug!(%snapshot, "Not bound to content yet, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(%snapshot, error = %e, "Label sync failed");
                    report.failed += 1;
                }
            }
        }
        info!(?report, "Label sync sweep done");
        Ok(report)
    }

    async fn patch_labels(&self, content_name: &str, labels: Value) -> Result<()> {
        self.client
            .patch(
                ResourceKind::VolumeSnapshotContent,
                None,
                content_name,
                &json!({"metadata": {"labels": labels}}),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryClient, Operation};
    use crate::retention::{LABEL_DAILY, LABEL_TYPE, LABEL_WEEKLY};
    use backup_common::VolumeSnapshot;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn bound_snapshot(client: &InMemoryClient, name: &str, snapshot_labels: Labels) -> String {
        let vs = VolumeSnapshot::from_pvc("ns", name, "data", None, snapshot_labels, Default::default());
        let created = client.create_snapshot(&vs).await.unwrap();
        created.bound_content_name().unwrap().to_string()
    }

    #[test]
    fn test_diff() {
        let snapshot = labels(&[(LABEL_TYPE, "cronjob"), (LABEL_DAILY, "2024-01-10")]);
        let content = labels(&[(LABEL_TYPE, "cronjob"), (LABEL_WEEKLY, "w02")]);
        let diff = LabelDiff::compute(&snapshot, &content);
        assert_eq!(diff.changed, labels(&[(LABEL_DAILY, "2024-01-10")]));
        assert_eq!(diff.stale, vec![LABEL_WEEKLY.to_string()]);

        assert!(LabelDiff::compute(&snapshot, &snapshot).is_empty());
    }

    #[tokio::test]
    async fn test_stale_keys_alone_trigger_a_sync() {
        let client = Arc::new(InMemoryClient::new());
        let content_name = bound_snapshot(
            &client,
            "data-1",
            labels(&[(LABEL_TYPE, "cronjob"), (LABEL_DAILY, "2024-01-10")]),
        )
        .await;

        // content matches every snapshot label and holds one more
        let mut content = client.content(&content_name).await.unwrap();
        content.metadata.labels = labels(&[
            (LABEL_TYPE, "cronjob"),
            (LABEL_DAILY, "2024-01-10"),
            (LABEL_WEEKLY, "w02"),
        ]);
        client.insert_content(content).await;

        let diff = LabelDiff::compute(
            &labels(&[(LABEL_TYPE, "cronjob"), (LABEL_DAILY, "2024-01-10")]),
            &client.content(&content_name).await.unwrap().metadata.labels,
        );
        assert!(diff.changed.is_empty());
        assert!(!diff.is_empty());

        let syncer = LabelSyncer::new(client.clone());
        assert!(syncer.sync("ns", "data-1").await.unwrap().applied);
        let content = client.content(&content_name).await.unwrap();
        assert!(!content.metadata.labels.contains_key(LABEL_WEEKLY));
        assert!(!syncer.sync("ns", "data-1").await.unwrap().applied);
    }

    #[tokio::test]
    async fn test_sync_copies_managed_labels_only() {
        let client = Arc::new(InMemoryClient::new());
        let content_name = bound_snapshot(
            &client,
            "data-1",
            labels(&[(LABEL_TYPE, "cronjob"), (LABEL_DAILY, "2024-01-10"), ("app", "db")]),
        )
        .await;
        let syncer = LabelSyncer::new(client.clone());

        assert!(syncer.sync("ns", "data-1").await.unwrap().applied);

        let content = client.content(&content_name).await.unwrap();
        assert_eq!(
            content.metadata.labels,
            labels(&[(LABEL_TYPE, "cronjob"), (LABEL_DAILY, "2024-01-10")])
        );

        client.clear_calls().await;
        assert!(!syncer.sync("ns", "data-1").await.unwrap().applied);
        assert!(!client.operations().await.contains(&Operation::Patch));
    }

    #[tokio::test]
    async fn test_sync_removes_stale_keys_before_adding() {
        let client = Arc::new(InMemoryClient::new());
        let content_name =
            bound_snapshot(&client, "data-1", labels(&[(LABEL_TYPE, "cronjob")])).await;

        // content still carries a label the snapshot lost, plus a foreign one
        let mut content = client.content(&content_name).await.unwrap();
        content.metadata.labels = labels(&[(LABEL_WEEKLY, "w02"), ("team", "x")]);
        client.insert_content(content).await;
        client.clear_calls().await;

        let result = LabelSyncer::new(client.clone()).sync("ns", "data-1").await.unwrap();
        assert!(result.applied);

        let patches: Vec<Value> = client
            .calls()
            .await
            .into_iter()
            .filter_map(|c| c.patch)
            .collect();
        assert_eq!(
            patches,
            vec![
                json!({"metadata": {"labels": {LABEL_WEEKLY: null}}}),
                json!({"metadata": {"labels": {LABEL_TYPE: "cronjob"}}}),
            ]
        );

        let content = client.content(&content_name).await.unwrap();
        assert_eq!(
            content.metadata.labels,
            labels(&[(LABEL_TYPE, "cronjob"), ("team", "x")])
        );
    }

    #[tokio::test]
    async fn test_sync_unbound_snapshot_fails() {
        let client = Arc::new(InMemoryClient::new());
        client
            .insert_snapshot(VolumeSnapshot::from_pvc(
                "ns",
                "pending",
                "data",
                None,
                labels(&[(LABEL_TYPE, "cronjob")]),
                Default::default(),
            ))
            .await;
        let syncer = LabelSyncer::new(client.clone());

        let err = syncer.sync("ns", "pending").await.unwrap_err();
        assert!(matches!(err, BackupError::Unbound(_)));

        let err = syncer.sync("ns", "missing").await.unwrap_err();
        assert!(matches!(err, BackupError::Client(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_sync_all_counts() {
        let client = Arc::new(InMemoryClient::new());
        bound_snapshot(&client, "a", labels(&[(LABEL_TYPE, "cronjob")])).await;
        bound_snapshot(&client, "b", labels(&[(LABEL_TYPE, "adhoc")])).await;
        client
            .insert_snapshot(VolumeSnapshot::from_pvc(
                "ns",
                "c",
                "data",
                None,
                labels(&[(LABEL_TYPE, "cronjob")]),
                Default::default(),
            ))
            .await;
        let syncer = LabelSyncer::new(client.clone());

        LabelSyncer::new(client.clone()).sync("ns", "a").await.unwrap();

        let report = syncer.sync_all(&Scope::AllNamespaces).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                changed: 1,
                unchanged: 1,
                skipped: 1,
                failed: 0
            }
        );
    }
}
