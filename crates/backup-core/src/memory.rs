//! In-memory [`ResourceClient`] for development and testing.
//!
//! Simulates just enough of the snapshot controller to drive every flow in
//! this crate: new snapshots get bound to generated content, deleting a
//! snapshot honours the content's deletion policy, and merge patches are
//! applied to the stored JSON. Every call is recorded in order and any
//! operation can be made to fail on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_common::{
    qualified_name, ClientError, ContentSource, DeletionPolicy, LabelSelector, ObjectMeta,
    ObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, ResourceClient, ResourceKind, Result, Scope, SnapshotSource,
    VolumeSnapshot, VolumeSnapshotContent, VolumeSnapshotContentSpec,
    VolumeSnapshotContentStatus, VolumeSnapshotStatus, CLAIM_BOUND_PHASE,
};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetSnapshot,
    GetContent,
    Exists,
    ListSnapshots,
    CreateSnapshot,
    CreateContent,
    CreateClaim,
    Patch,
    Delete,
    WaitForCondition,
}

/// One recorded call against the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCall {
    pub operation: Operation,
    pub kind: ResourceKind,
    /// `namespace/name`, the bare name for cluster-scoped objects, or the
    /// rendered selector for list calls.
    pub target: String,
    pub patch: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Times(u32),
    Always,
}

#[derive(Default)]
struct State {
    snapshots: BTreeMap<(String, String), VolumeSnapshot>,
    contents: BTreeMap<String, VolumeSnapshotContent>,
    claims: BTreeMap<(String, String), PersistentVolumeClaim>,
    calls: Vec<ClientCall>,
    failures: HashMap<Operation, FailurePlan>,
}

impl State {
    fn record(&mut self, operation: Operation, kind: ResourceKind, target: String, patch: Option<Value>) {
        self.calls.push(ClientCall {
            operation,
            kind,
            target,
            patch,
        });
    }

    fn injected_failure(&mut self, operation: Operation) -> Result<()> {
        let fail = match self.failures.get_mut(&operation) {
            Some(FailurePlan::Always) => true,
            Some(FailurePlan::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        if fail {
            Err(ClientError::Api(format!("injected {operation:?} failure")))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct InMemoryClient {
    state: Arc<RwLock<State>>,
    driver: String,
    deletion_policy: DeletionPolicy,
    ready_on_create: bool,
    restore_size: String,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            driver: "hostpath.csi.k8s.io".to_string(),
            deletion_policy: DeletionPolicy::Retain,
            ready_on_create: true,
            restore_size: "1Gi".to_string(),
        }
    }

    /// Deletion policy given to content generated for new snapshots, the
    /// equivalent of the snapshot class setting.
    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = policy;
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Whether the simulated controller marks new snapshots ready at once.
    pub fn with_ready_on_create(mut self, ready: bool) -> Self {
        self.ready_on_create = ready;
        self
    }

    /// Restore size the simulated controller reports for new snapshots.
    pub fn with_restore_size(mut self, size: impl Into<String>) -> Self {
        self.restore_size = size.into();
        self
    }

    /// Store a bound claim without a data source.
    pub async fn add_claim(&self, namespace: &str, name: &str) {
        let claim = PersistentVolumeClaim {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: PersistentVolumeClaimSpec::default(),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(CLAIM_BOUND_PHASE.to_string()),
                extra: BTreeMap::new(),
            }),
        };
        self.state
            .write()
            .await
            .claims
            .insert((namespace.to_string(), name.to_string()), claim);
    }

    pub async fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .read()
            .await
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Store an object as-is, bypassing the simulated controller and the call log.
    pub async fn insert_snapshot(&self, snapshot: VolumeSnapshot) {
        let key = (snapshot.namespace().to_string(), snapshot.name().to_string());
        self.state.write().await.snapshots.insert(key, snapshot);
    }

    /// Store an object as-is, bypassing the simulated controller and the call log.
    pub async fn insert_content(&self, content: VolumeSnapshotContent) {
        self.state
            .write()
            .await
            .contents
            .insert(content.name().to_string(), content);
    }

    pub async fn snapshot(&self, namespace: &str, name: &str) -> Option<VolumeSnapshot> {
        self.state
            .read()
            .await
            .snapshots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub async fn content(&self, name: &str) -> Option<VolumeSnapshotContent> {
        self.state.read().await.contents.get(name).cloned()
    }

    pub async fn content_names(&self) -> Vec<String> {
        self.state.read().await.contents.keys().cloned().collect()
    }

    /// Flip the readiness the simulated controller reports for a snapshot.
    pub async fn set_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state.write().await;
        if let Some(vs) = state
            .snapshots
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            vs.status.get_or_insert_with(Default::default).ready_to_use = Some(ready);
        }
    }

    /// Fail the next `times` calls of `operation`.
    pub async fn fail_next(&self, operation: Operation, times: u32) {
        self.state
            .write()
            .await
            .failures
            .insert(operation, FailurePlan::Times(times));
    }

    pub async fn fail_always(&self, operation: Operation) {
        self.state
            .write()
            .await
            .failures
            .insert(operation, FailurePlan::Always);
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    pub async fn calls(&self) -> Vec<ClientCall> {
        self.state.read().await.calls.clone()
    }

    pub async fn operations(&self) -> Vec<Operation> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .map(|c| c.operation)
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.write().await.calls.clear();
    }

    fn generated_content(&self, vs: &VolumeSnapshot, pvc_name: &str) -> VolumeSnapshotContent {
        let id = Uuid::new_v4();
        let mut content = VolumeSnapshotContent::new(
            &format!("snapcontent-{id}"),
            VolumeSnapshotContentSpec {
                deletion_policy: self.deletion_policy,
                driver: Some(self.driver.clone()),
                source: ContentSource {
                    snapshot_handle: None,
                    volume_handle: Some(format!("pvc-{pvc_name}")),
                },
                volume_snapshot_class_name: vs.spec.volume_snapshot_class_name.clone(),
                volume_snapshot_ref: Some(ObjectReference {
                    name: Some(vs.name().to_string()),
                    namespace: Some(vs.namespace().to_string()),
                    extra: BTreeMap::new(),
                }),
            },
            Default::default(),
        );
        content.status = Some(VolumeSnapshotContentStatus {
            snapshot_handle: Some(format!("snapshot-{id}")),
            ready_to_use: Some(self.ready_on_create),
            extra: BTreeMap::new(),
        });
        content
    }
}

#[async_trait]
impl ResourceClient for InMemoryClient {
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<VolumeSnapshot> {
        let mut state = self.state.write().await;
        let kind = ResourceKind::VolumeSnapshot;
        state.record(Operation::GetSnapshot, kind, qualified_name(Some(namespace), name), None);
        state.injected_failure(Operation::GetSnapshot)?;
        state
            .snapshots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::not_found(kind, Some(namespace), name))
    }

    async fn get_content(&self, name: &str) -> Result<VolumeSnapshotContent> {
        let mut state = self.state.write().await;
        let kind = ResourceKind::VolumeSnapshotContent;
        state.record(Operation::GetContent, kind, name.to_string(), None);
        state.injected_failure(Operation::GetContent)?;
        state
            .contents
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::not_found(kind, None, name))
    }

    async fn exists(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        state.record(Operation::Exists, kind, qualified_name(namespace, name), None);
        state.injected_failure(Operation::Exists)?;
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        Ok(match kind {
            ResourceKind::VolumeSnapshot => state.snapshots.contains_key(&key),
            ResourceKind::VolumeSnapshotContent => state.contents.contains_key(name),
            ResourceKind::PersistentVolumeClaim => state.claims.contains_key(&key),
        })
    }

    async fn list_snapshots(
        &self,
        scope: &Scope,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>> {
        let mut state = self.state.write().await;
        state.record(
            Operation::ListSnapshots,
            ResourceKind::VolumeSnapshot,
            selector.to_string(),
            None,
        );
        state.injected_failure(Operation::ListSnapshots)?;
        Ok(state
            .snapshots
            .values()
            .filter(|vs| scope.contains(vs.namespace()))
            .filter(|vs| selector.matches(&vs.metadata.labels))
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let mut state = self.state.write().await;
        let kind = ResourceKind::VolumeSnapshot;
        let key = (snapshot.namespace().to_string(), snapshot.name().to_string());
        state.record(
            Operation::CreateSnapshot,
            kind,
            qualified_name(Some(&key.0), &key.1),
            None,
        );
        state.injected_failure(Operation::CreateSnapshot)?;

        if state.snapshots.contains_key(&key) {
            return Err(ClientError::Conflict {
                kind,
                name: qualified_name(Some(&key.0), &key.1),
            });
        }

        let mut created = snapshot.clone();
        let status = match &snapshot.spec.source {
            SnapshotSource::PersistentVolumeClaimName(pvc) => {
                let content = self.generated_content(snapshot, pvc);
                let status = VolumeSnapshotStatus {
                    bound_volume_snapshot_content_name: Some(content.name().to_string()),
                    ready_to_use: Some(self.ready_on_create),
                    restore_size: Some(self.restore_size.clone()),
                    extra: BTreeMap::new(),
                };
                state.contents.insert(content.name().to_string(), content);
                status
            }
            SnapshotSource::VolumeSnapshotContentName(content_name) => {
                match state.contents.get(content_name) {
                    Some(content) => VolumeSnapshotStatus {
                        bound_volume_snapshot_content_name: Some(content_name.clone()),
                        ready_to_use: Some(
                            self.ready_on_create
                                && content
                                    .status
                                    .as_ref()
                                    .and_then(|s| s.ready_to_use)
                                    .unwrap_or(false),
                        ),
                        restore_size: Some(self.restore_size.clone()),
                        extra: BTreeMap::new(),
                    },
                    None => VolumeSnapshotStatus {
                        ready_to_use: Some(false),
                        ..Default::default()
                    },
                }
            }
        };
        created.status = Some(status);
        state.snapshots.insert(key, created.clone());
        Ok(created)
    }

    async fn create_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        let mut state = self.state.write().await;
        let kind = ResourceKind::VolumeSnapshotContent;
        state.record(Operation::CreateContent, kind, content.name().to_string(), None);
        state.injected_failure(Operation::CreateContent)?;

        if state.contents.contains_key(content.name()) {
            return Err(ClientError::Conflict {
                kind,
                name: content.name().to_string(),
            });
        }

        let mut created = content.clone();
        if created.status.is_none() {
            // pre-provisioned content: the controller reports the given handle back
            if let Some(handle) = &content.spec.source.snapshot_handle {
                created.status = Some(VolumeSnapshotContentStatus {
                    snapshot_handle: Some(handle.clone()),
                    ready_to_use: Some(true),
                    extra: BTreeMap::new(),
                });
            }
        }
        state
            .contents
            .insert(created.name().to_string(), created.clone());
        Ok(created)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut state = self.state.write().await;
        let kind = ResourceKind::PersistentVolumeClaim;
        let key = (claim.namespace().to_string(), claim.name().to_string());
        state.record(
            Operation::CreateClaim,
            kind,
            qualified_name(Some(&key.0), &key.1),
            None,
        );
        state.injected_failure(Operation::CreateClaim)?;

        if state.claims.contains_key(&key) {
            return Err(ClientError::Conflict {
                kind,
                name: qualified_name(Some(&key.0), &key.1),
            });
        }

        // binds at once when the source snapshot exists and is ready, stays pending otherwise
        let bound = match claim.source_snapshot() {
            Some(snapshot) => state
                .snapshots
                .get(&(key.0.clone(), snapshot.to_string()))
                .is_some_and(VolumeSnapshot::is_ready),
            None => true,
        };
        let mut created = claim.clone();
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some(if bound { CLAIM_BOUND_PHASE } else { "Pending" }.to_string()),
            extra: BTreeMap::new(),
        });
        state.claims.insert(key, created.clone());
        Ok(created)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.record(
            Operation::Patch,
            kind,
            qualified_name(namespace, name),
            Some(patch.clone()),
        );
        state.injected_failure(Operation::Patch)?;

        let not_found = || ClientError::not_found(kind, namespace, name);
        match kind {
            ResourceKind::VolumeSnapshot => {
                let key = (namespace.unwrap_or_default().to_string(), name.to_string());
                let vs = state.snapshots.get_mut(&key).ok_or_else(not_found)?;
                *vs = apply_merge_patch(vs, patch)?;
            }
            ResourceKind::VolumeSnapshotContent => {
                let vsc = state.contents.get_mut(name).ok_or_else(not_found)?;
                *vsc = apply_merge_patch(vsc, patch)?;
            }
            ResourceKind::PersistentVolumeClaim => {
                let key = (namespace.unwrap_or_default().to_string(), name.to_string());
                let claim = state.claims.get_mut(&key).ok_or_else(not_found)?;
                *claim = apply_merge_patch(claim, patch)?;
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        _wait: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.record(Operation::Delete, kind, qualified_name(namespace, name), None);
        state.injected_failure(Operation::Delete)?;

        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        match kind {
            ResourceKind::VolumeSnapshot => {
                let vs = state
                    .snapshots
                    .remove(&key)
                    .ok_or_else(|| ClientError::not_found(kind, namespace, name))?;
                // the controller removes bound content only under the Delete policy
                if let Some(content_name) = vs.bound_content_name() {
                    let destroy = state
                        .contents
                        .get(content_name)
                        .map(|c| c.spec.deletion_policy == DeletionPolicy::Delete)
                        .unwrap_or(false);
                    if destroy {
                        state.contents.remove(content_name);
                    }
                }
            }
            ResourceKind::VolumeSnapshotContent => {
                state
                    .contents
                    .remove(name)
                    .ok_or_else(|| ClientError::not_found(kind, namespace, name))?;
            }
            ResourceKind::PersistentVolumeClaim => {
                state
                    .claims
                    .remove(&key)
                    .ok_or_else(|| ClientError::not_found(kind, namespace, name))?;
            }
        }
        Ok(())
    }

    async fn wait_for_condition(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        json_path: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.record(
            Operation::WaitForCondition,
            kind,
            qualified_name(namespace, name),
            None,
        );
        state.injected_failure(Operation::WaitForCondition)?;

        let object = match kind {
            ResourceKind::VolumeSnapshot => state
                .snapshots
                .get(&(namespace.unwrap_or_default().to_string(), name.to_string()))
                .map(serde_json::to_value),
            ResourceKind::VolumeSnapshotContent => {
                state.contents.get(name).map(serde_json::to_value)
            }
            ResourceKind::PersistentVolumeClaim => state
                .claims
                .get(&(namespace.unwrap_or_default().to_string(), name.to_string()))
                .map(serde_json::to_value),
        }
        .transpose()?
        .ok_or_else(|| ClientError::not_found(kind, namespace, name))?;

        match lookup_json_path(&object, json_path) {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(ClientError::Timeout {
                kind,
                name: qualified_name(namespace, name),
                timeout,
                message: format!("{json_path} is {actual:?}, want {expected:?}"),
            }),
        }
    }
}

fn apply_merge_patch<T>(object: &T, patch: &Value) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(object)?;
    merge_patch(&mut value, patch);
    Ok(serde_json::from_value(value)?)
}

/// RFC 7386 JSON merge patch.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Resolves simple `{.a.b.c}` paths to their string rendering.
fn lookup_json_path(object: &Value, json_path: &str) -> Option<String> {
    let path = json_path
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim_start_matches('.');
    let mut current = object;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}}));

        let mut target = json!({"labels": {"x": "1"}});
        merge_patch(&mut target, &json!({"labels": {"y": "2"}}));
        assert_eq!(target, json!({"labels": {"x": "1", "y": "2"}}));
    }

    #[test]
    fn test_lookup_json_path() {
        let object = json!({"status": {"readyToUse": true, "name": "x"}});
        assert_eq!(
            lookup_json_path(&object, "{.status.readyToUse}").as_deref(),
            Some("true")
        );
        assert_eq!(lookup_json_path(&object, "{.status.name}").as_deref(), Some("x"));
        assert_eq!(lookup_json_path(&object, "{.status.missing}"), None);
    }

    #[tokio::test]
    async fn test_snapshot_delete_honours_deletion_policy() {
        let client = InMemoryClient::new().with_deletion_policy(DeletionPolicy::Retain);
        let vs = VolumeSnapshot::from_pvc("ns", "keep", "data", None, Default::default(), Default::default());
        let created = client.create_snapshot(&vs).await.unwrap();
        let content_name = created.bound_content_name().unwrap().to_string();

        client
            .delete(ResourceKind::VolumeSnapshot, Some("ns"), "keep", true)
            .await
            .unwrap();
        assert!(client.content(&content_name).await.is_some());

        let client = InMemoryClient::new().with_deletion_policy(DeletionPolicy::Delete);
        let created = client.create_snapshot(&vs).await.unwrap();
        let content_name = created.bound_content_name().unwrap().to_string();
        client
            .delete(ResourceKind::VolumeSnapshot, Some("ns"), "keep", false)
            .await
            .unwrap();
        assert!(client.content(&content_name).await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_and_call_log() {
        let client = InMemoryClient::new();
        client.fail_next(Operation::GetContent, 1).await;

        assert!(client.get_content("missing").await.is_err());
        let err = client.get_content("missing").await.unwrap_err();
        assert!(err.is_not_found());

        assert_eq!(
            client.operations().await,
            vec![Operation::GetContent, Operation::GetContent]
        );
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let client = InMemoryClient::new();
        let vs = VolumeSnapshot::from_pvc("ns", "dup", "data", None, Default::default(), Default::default());
        client.create_snapshot(&vs).await.unwrap();
        let err = client.create_snapshot(&vs).await.unwrap_err();
        assert!(matches!(err, ClientError::Conflict { .. }));
    }
}
