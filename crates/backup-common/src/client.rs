use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    LabelSelector, PersistentVolumeClaim, ResourceKind, Result, Scope, VolumeSnapshot,
    VolumeSnapshotContent,
};

/// Access to the cluster API.
///
/// Every mutation is last-write-wins; implementations do not add optimistic
/// concurrency on top of what the API server does.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<VolumeSnapshot>;

    async fn get_content(&self, name: &str) -> Result<VolumeSnapshotContent>;

    /// Existence check for any kind, e.g. the claim a backup targets.
    async fn exists(&self, kind: ResourceKind, namespace: Option<&str>, name: &str)
        -> Result<bool>;

    async fn list_snapshots(
        &self,
        scope: &Scope,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>>;

    /// Fails with `ClientError::Conflict` if the object already exists.
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    async fn create_content(&self, content: &VolumeSnapshotContent)
        -> Result<VolumeSnapshotContent>;

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// JSON merge patch (RFC 7386). A `null` value removes the key.
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()>;

    /// With `wait` the call returns only once the object is gone.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        wait: bool,
    ) -> Result<()>;

    /// Blocks until the value at `json_path` equals `expected` or `timeout`
    /// elapses (`ClientError::Timeout`).
    async fn wait_for_condition(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        json_path: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<()>;
}
