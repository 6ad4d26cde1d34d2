//! Typed cluster objects for the snapshot API group.
//!
//! Only the fields this workspace reads or writes are modelled. Anything else
//! the API server returns is kept in the `extra` bags so objects survive a
//! read-modify-write round trip.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SNAPSHOT_API_VERSION: &str = "snapshot.storage.k8s.io/v1";

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    VolumeSnapshot,
    VolumeSnapshotContent,
    PersistentVolumeClaim,
}

impl ResourceKind {
    /// Lowercase resource name as understood by the API server.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::VolumeSnapshot => "volumesnapshot",
            ResourceKind::VolumeSnapshotContent => "volumesnapshotcontent",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::VolumeSnapshotContent)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (namespace, name) pair identifying a namespaced object.
///
/// Equality, hashing and ordering all use the lowercased concatenation of
/// namespace and name so listings sort stably regardless of case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespacedRef {
    pub namespace: String,
    pub name: String,
}

impl NamespacedRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn sort_key(&self) -> String {
        format!("{}{}", self.namespace, self.name).to_lowercase()
    }
}

impl PartialEq for NamespacedRef {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for NamespacedRef {}

impl Hash for NamespacedRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state);
    }
}

impl PartialOrd for NamespacedRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NamespacedRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for NamespacedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Passthrough metadata (uid, resourceVersion, timestamps, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    #[default]
    Retain,
    Delete,
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionPolicy::Retain => f.write_str("Retain"),
            DeletionPolicy::Delete => f.write_str("Delete"),
        }
    }
}

// --- VolumeSnapshot ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    pub source: SnapshotSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Either a dynamic snapshot of a claim or a binding to pre-provisioned content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotSource {
    PersistentVolumeClaimName(String),
    VolumeSnapshotContentName(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Minimum size of a volume restored from this snapshot, e.g. `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VolumeSnapshot {
    /// Snapshot of a persistent volume claim. Without a class the cluster
    /// default class is used.
    pub fn from_pvc(
        namespace: &str,
        name: &str,
        pvc_name: &str,
        class_name: Option<String>,
        labels: Labels,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        Self {
            api_version: SNAPSHOT_API_VERSION.to_string(),
            kind: "VolumeSnapshot".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                labels,
                annotations,
                extra: BTreeMap::new(),
            },
            spec: VolumeSnapshotSpec {
                source: SnapshotSource::PersistentVolumeClaimName(pvc_name.to_string()),
                volume_snapshot_class_name: class_name,
            },
            status: None,
        }
    }

    /// Snapshot bound by name to an existing content object.
    pub fn from_content(
        namespace: &str,
        name: &str,
        content_name: &str,
        class_name: Option<String>,
        labels: Labels,
    ) -> Self {
        Self {
            api_version: SNAPSHOT_API_VERSION.to_string(),
            kind: "VolumeSnapshot".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                labels,
                ..Default::default()
            },
            spec: VolumeSnapshotSpec {
                source: SnapshotSource::VolumeSnapshotContentName(content_name.to_string()),
                volume_snapshot_class_name: class_name,
            },
            status: None,
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn reference(&self) -> NamespacedRef {
        NamespacedRef::new(self.namespace(), self.name())
    }

    /// Name of the bound content object, if the controller has bound one yet.
    pub fn bound_content_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bound_volume_snapshot_content_name.as_deref())
            .filter(|name| !name.is_empty())
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    pub fn restore_size(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.restore_size.as_deref())
            .filter(|size| !size.is_empty())
    }
}

// --- VolumeSnapshotContent ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContent {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotContentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotContentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentSpec {
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub source: ContentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VolumeSnapshotContent {
    pub fn new(name: &str, spec: VolumeSnapshotContentSpec, labels: Labels) -> Self {
        Self {
            api_version: SNAPSHOT_API_VERSION.to_string(),
            kind: "VolumeSnapshotContent".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                labels,
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Storage handle reported by the driver once the snapshot was cut.
    pub fn snapshot_handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.snapshot_handle.as_deref())
            .filter(|h| !h.is_empty())
    }

    /// The snapshot this content is (or was) bound to.
    pub fn snapshot_ref(&self) -> Option<NamespacedRef> {
        let reference = self.spec.volume_snapshot_ref.as_ref()?;
        match (reference.namespace.as_deref(), reference.name.as_deref()) {
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                Some(NamespacedRef::new(ns, name))
            }
            _ => None,
        }
    }
}

// --- PersistentVolumeClaim ---

pub const CLAIM_BOUND_PHASE: &str = "Bound";

/// A claim, modelled only as far as restoring from a snapshot needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeClaimStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<TypedLocalObjectReference>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PersistentVolumeClaim {
    /// `ReadWriteOnce` claim of `storage` whose data comes from the snapshot
    /// `snapshot_name` in the same namespace. Without a class the cluster
    /// default class is used.
    pub fn from_snapshot(
        namespace: &str,
        name: &str,
        snapshot_name: &str,
        storage: &str,
        storage_class: Option<String>,
    ) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: PersistentVolumeClaimSpec {
                access_modes: vec!["ReadWriteOnce".to_string()],
                resources: ResourceRequirements {
                    requests: BTreeMap::from([("storage".to_string(), storage.to_string())]),
                },
                storage_class_name: storage_class,
                data_source: Some(TypedLocalObjectReference {
                    api_group: Some("snapshot.storage.k8s.io".to_string()),
                    kind: "VolumeSnapshot".to_string(),
                    name: snapshot_name.to_string(),
                }),
                extra: BTreeMap::new(),
            },
            status: None,
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn reference(&self) -> NamespacedRef {
        NamespacedRef::new(self.namespace(), self.name())
    }

    /// Name of the snapshot this claim restores, if any.
    pub fn source_snapshot(&self) -> Option<&str> {
        self.spec
            .data_source
            .as_ref()
            .filter(|source| source.kind == "VolumeSnapshot")
            .map(|source| source.name.as_str())
    }

    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }
}
