//! Recovery of orphaned snapshot content.
//!
//! When the namespace holding a snapshot is deleted, content with the
//! `Retain` policy survives without a snapshot pointing at it. Rebinding
//! creates fresh pre-provisioned content for the same storage handle plus a
//! snapshot bound to it by name, then removes the orphan.

use std::collections::BTreeMap;
use std::time::Duration;

use backup_common::{
    ClientError, ContentSource, DeletionPolicy, NamespacedRef, ObjectReference, ResourceKind,
    VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSpec,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::lifecycle::SnapshotLifecycleController;
use crate::{BackupError, Result};

/// Objects produced by [`ContentRebinder::rebuild`].
#[derive(Debug, Clone, PartialEq)]
pub struct RebuiltContent {
    pub content: VolumeSnapshotContent,
    /// Not yet submitted by `rebuild`; after `rebind` this is the created object.
    pub snapshot: VolumeSnapshot,
}

impl RebuiltContent {
    pub fn snapshot_ref(&self) -> NamespacedRef {
        self.snapshot.reference()
    }
}

/// Replace the last `-segment` of `name` with `-suffix`, so repeated
/// rebinds keep the same base name.
pub fn rebound_snapshot_name(name: &str, suffix: &str) -> String {
    let base = name.rsplit_once('-').map_or(name, |(base, _)| base);
    format!("{base}-{suffix}")
}

pub struct ContentRebinder {
    lifecycle: SnapshotLifecycleController,
}

impl ContentRebinder {
    pub fn new(lifecycle: SnapshotLifecycleController) -> Self {
        Self { lifecycle }
    }

    /// Create retained pre-provisioned content for the orphan's storage and
    /// derive the snapshot that binds it. Every precondition is checked
    /// before anything is created.
    #[instrument(skip(self, orphan), fields(orphan = orphan.name()))]
    pub async fn rebuild(&self, orphan: &VolumeSnapshotContent, suffix: &str) -> Result<RebuiltContent> {
        let precondition = |reason: &str| BackupError::RebindPrecondition {
            content: orphan.name().to_string(),
            reason: reason.to_string(),
        };

        let driver = orphan
            .spec
            .driver
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| precondition("spec.driver is not set"))?;
        let handle = orphan
            .snapshot_handle()
            .ok_or_else(|| precondition("status.snapshotHandle is not set"))?;
        let original = orphan
            .snapshot_ref()
            .ok_or_else(|| precondition("spec.volumeSnapshotRef lacks name or namespace"))?;

        let snapshot_name = rebound_snapshot_name(&original.name, suffix);
        let class_name = orphan.spec.volume_snapshot_class_name.clone();
        let labels = orphan.metadata.labels.clone();

        let content = VolumeSnapshotContent::new(
            &format!("restoredvsc-{}", Uuid::new_v4()),
            VolumeSnapshotContentSpec {
                deletion_policy: DeletionPolicy::Retain,
                driver: Some(driver.to_string()),
                source: ContentSource {
                    snapshot_handle: Some(handle.to_string()),
                    volume_handle: None,
                },
                volume_snapshot_class_name: class_name.clone(),
                volume_snapshot_ref: Some(ObjectReference {
                    name: Some(snapshot_name.clone()),
                    namespace: Some(original.namespace.clone()),
                    extra: BTreeMap::new(),
                }),
            },
            labels.clone(),
        );

        let content = if self.lifecycle.is_dry_run() {
            let rendered = serde_json::to_string_pretty(&content).map_err(ClientError::from)?;
            info!("Skipping content creation - dry run mode is active:\n{rendered}");
            content
        } else {
            let created = self.lifecycle.client().create_content(&content).await?;
            info!(content = created.name(), handle, "Created pre-provisioned content");
            created
        };

        let snapshot = VolumeSnapshot::from_content(
            &original.namespace,
            &snapshot_name,
            content.name(),
            class_name,
            labels,
        );

        Ok(RebuiltContent { content, snapshot })
    }

    /// Delete the orphan, but only while its policy is still `Retain`: under
    /// `Delete` the storage the new content points at would go with it.
    #[instrument(skip(self))]
    pub async fn delete_orphan(&self, name: &str, wait: bool) -> Result<()> {
        let orphan = self.lifecycle.client().get_content(name).await?;
        if orphan.spec.deletion_policy != DeletionPolicy::Retain {
            return Err(BackupError::RebindUnsafeDelete {
                content: name.to_string(),
                policy: orphan.spec.deletion_policy,
            });
        }

        if self.lifecycle.is_dry_run() {
            info!("Skipping orphan deletion - dry run mode is active");
            return Ok(());
        }

        self.lifecycle
            .client()
            .delete(ResourceKind::VolumeSnapshotContent, None, name, wait)
            .await?;
        info!("Deleted orphaned content");
        Ok(())
    }

    /// Full recovery of the orphan `orphan_name`: rebuild, create the
    /// snapshot, optionally wait for it to be ready, delete the orphan.
    /// A failed wait leaves the orphan in place.
    #[instrument(skip(self))]
    pub async fn rebind(
        &self,
        orphan_name: &str,
        suffix: &str,
        wait: Option<Duration>,
    ) -> Result<RebuiltContent> {
        let orphan = self.lifecycle.client().get_content(orphan_name).await?;
        let mut rebuilt = self.rebuild(&orphan, suffix).await?;

        rebuilt.snapshot = self.lifecycle.create(&rebuilt.snapshot).await?;

        if let (Some(timeout), false) = (wait, self.lifecycle.is_dry_run()) {
            self.lifecycle
                .wait_until_ready(&rebuilt.snapshot_ref(), timeout)
                .await?;
        }

        self.delete_orphan(orphan_name, wait.is_some()).await?;
        info!(snapshot = %rebuilt.snapshot_ref(), content = rebuilt.content.name(), "Rebound orphaned content");
        Ok(rebuilt)
    }
}
