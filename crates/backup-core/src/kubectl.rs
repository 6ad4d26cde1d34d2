//! [`ResourceClient`] that shells out to `kubectl`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use backup_common::{
    qualified_name, ClientError, LabelSelector, PersistentVolumeClaim, ResourceClient,
    ResourceKind, Result, Scope, VolumeSnapshot, VolumeSnapshotContent,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// The object a failed invocation was about, for error classification.
struct Target<'a> {
    kind: ResourceKind,
    namespace: Option<&'a str>,
    name: &'a str,
}

#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: PathBuf,
    context: Option<String>,
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KubectlClient {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            context: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Use this kubeconfig context instead of the current one.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Namespace of the current kubeconfig context, if one is set.
    pub async fn current_namespace(&self) -> Option<String> {
        let args = ["config", "view", "--minify", "--output", "jsonpath={..namespace}"]
            .map(String::from)
            .to_vec();
        match self.run(&args, None).await {
            Ok(stdout) => Some(String::from_utf8_lossy(&stdout).trim().to_string())
                .filter(|ns| !ns.is_empty()),
            Err(e) => {
                debug!(error = %e, "Could not read namespace from kubeconfig");
                None
            }
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    /// Run kubectl, feeding `stdin` if given. Non-zero exits become `Api`
    /// errors carrying stderr.
    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        debug!(binary = %self.binary.display(), ?args, "Running kubectl");
        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match stdin {
            None => cmd.stdin(Stdio::null()).output().await?,
            Some(input) => {
                let mut child = cmd.stdin(Stdio::piped()).spawn()?;
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input).await?;
                    // closing stdin lets kubectl finish reading
                    drop(pipe);
                }
                child.wait_with_output().await?
            }
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(ClientError::Api(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Like [`run`](Self::run) but maps well-known failures on `target`
    /// onto typed errors.
    async fn run_on(
        &self,
        target: Target<'_>,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.run(args, stdin)
            .await
            .map_err(|e| classify_failure(e, &target, timeout))
    }

    async fn get_json<T: DeserializeOwned>(&self, target: Target<'_>) -> Result<T> {
        let mut args = object_args("get", target.kind, target.namespace, target.name);
        args.extend(["-o".to_string(), "json".to_string()]);
        let stdout = self.run_on(target, &args, None, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn create_json<T>(&self, target: Target<'_>, object: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let body = serde_json::to_vec(object)?;
        let args = ["create", "-f", "-", "-o", "json"].map(String::from).to_vec();
        let stdout = self.run_on(target, &args, Some(body.as_slice()), None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }
}

/// `<verb> <kind> [-n <namespace>] <name>`
fn object_args(verb: &str, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Vec<String> {
    let mut args = vec![verb.to_string(), kind.as_str().to_string()];
    if let Some(ns) = namespace.filter(|_| kind.is_namespaced()) {
        args.extend(["-n".to_string(), ns.to_string()]);
    }
    args.push(name.to_string());
    args
}

fn list_args(scope: &Scope, selector: &LabelSelector) -> Vec<String> {
    let mut args = vec!["get".to_string(), ResourceKind::VolumeSnapshot.as_str().to_string()];
    match scope {
        Scope::Namespace(ns) => args.extend(["-n".to_string(), ns.clone()]),
        Scope::AllNamespaces => args.push("--all-namespaces".to_string()),
    }
    if !selector.is_empty() {
        args.extend(["-l".to_string(), selector.to_string()]);
    }
    args.extend(["-o".to_string(), "json".to_string()]);
    args
}

fn classify_failure(err: ClientError, target: &Target<'_>, timeout: Option<Duration>) -> ClientError {
    let stderr = match err {
        ClientError::Api(stderr) => stderr,
        other => return other,
    };
    let name = qualified_name(target.namespace, target.name);
    if stderr.contains("(NotFound)") {
        ClientError::NotFound {
            kind: target.kind,
            name,
        }
    } else if stderr.contains("(AlreadyExists)") {
        ClientError::Conflict {
            kind: target.kind,
            name,
        }
    } else if let Some(timeout) = timeout.filter(|_| stderr.contains("timed out")) {
        ClientError::Timeout {
            kind: target.kind,
            name,
            timeout,
            message: stderr,
        }
    } else {
        ClientError::Api(stderr)
    }
}

#[async_trait]
impl ResourceClient for KubectlClient {
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<VolumeSnapshot> {
        self.get_json(Target {
            kind: ResourceKind::VolumeSnapshot,
            namespace: Some(namespace),
            name,
        })
        .await
    }

    async fn get_content(&self, name: &str) -> Result<VolumeSnapshotContent> {
        self.get_json(Target {
            kind: ResourceKind::VolumeSnapshotContent,
            namespace: None,
            name,
        })
        .await
    }

    async fn exists(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let mut args = object_args("get", kind, namespace, name);
        args.extend(["--ignore-not-found".to_string(), "-o".to_string(), "name".to_string()]);
        let stdout = self.run(&args, None).await?;
        Ok(!String::from_utf8_lossy(&stdout).trim().is_empty())
    }

    async fn list_snapshots(
        &self,
        scope: &Scope,
        selector: &LabelSelector,
    ) -> Result<Vec<VolumeSnapshot>> {
        let stdout = self.run(&list_args(scope, selector), None).await?;
        let list: ObjectList<VolumeSnapshot> = serde_json::from_slice(&stdout)?;
        Ok(list.items)
    }

    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let target = Target {
            kind: ResourceKind::VolumeSnapshot,
            namespace: Some(snapshot.namespace()),
            name: snapshot.name(),
        };
        self.create_json(target, snapshot).await
    }

    async fn create_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        let target = Target {
            kind: ResourceKind::VolumeSnapshotContent,
            namespace: None,
            name: content.name(),
        };
        self.create_json(target, content).await
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let target = Target {
            kind: ResourceKind::PersistentVolumeClaim,
            namespace: Some(claim.namespace()),
            name: claim.name(),
        };
        self.create_json(target, claim).await
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut args = object_args("patch", kind, namespace, name);
        args.extend([
            "--type".to_string(),
            "merge".to_string(),
            "-p".to_string(),
            patch.to_string(),
        ]);
        self.run_on(Target { kind, namespace, name }, &args, None, None)
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        wait: bool,
    ) -> Result<()> {
        let mut args = object_args("delete", kind, namespace, name);
        args.push(format!("--wait={wait}"));
        self.run_on(Target { kind, namespace, name }, &args, None, None)
            .await?;
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
        let mut args = object_args("wait", kind, namespace, name);
        args.extend([
            format!("--for=jsonpath={json_path}={expected}"),
            format!("--timeout={}s", timeout.as_secs().max(1)),
        ]);
        let target = Target { kind, namespace, name };
        match self.run_on(target, &args, None, Some(timeout)).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(kind = %kind, name, error = %e, "kubectl wait failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_args() {
        assert_eq!(
            object_args("get", ResourceKind::VolumeSnapshot, Some("team-a"), "data-1"),
            vec!["get", "volumesnapshot", "-n", "team-a", "data-1"]
        );
        // content is cluster scoped, a namespace is ignored
        assert_eq!(
            object_args("delete", ResourceKind::VolumeSnapshotContent, Some("team-a"), "snapcontent-1"),
            vec!["delete", "volumesnapshotcontent", "snapcontent-1"]
        );
    }

    #[test]
    fn test_list_args() {
        let selector = LabelSelector::new().exists("backup-ns.sh/type");
        assert_eq!(
            list_args(&Scope::AllNamespaces, &selector),
            vec!["get", "volumesnapshot", "--all-namespaces", "-l", "backup-ns.sh/type", "-o", "json"]
        );
        assert_eq!(
            list_args(&Scope::Namespace("team-a".to_string()), &LabelSelector::new()),
            vec!["get", "volumesnapshot", "-n", "team-a", "-o", "json"]
        );
    }

    #[test]
    fn test_classify_failure() {
        let target = Target {
            kind: ResourceKind::VolumeSnapshot,
            namespace: Some("team-a"),
            name: "data-1",
        };

        let err = classify_failure(
            ClientError::Api(
                r#"Error from server (NotFound): volumesnapshots.snapshot.storage.k8s.io "data-1" not found"#
                    .to_string(),
            ),
            &target,
            None,
        );
        assert!(err.is_not_found());

        let err = classify_failure(
            ClientError::Api(r#"Error from server (AlreadyExists): "data-1" already exists"#.to_string()),
            &target,
            None,
        );
        assert!(matches!(err, ClientError::Conflict { .. }));

        let err = classify_failure(
            ClientError::Api("error: timed out waiting for the condition on volumesnapshots/data-1".to_string()),
            &target,
            Some(Duration::from_secs(5)),
        );
        assert!(matches!(err, ClientError::Timeout { .. }));

        let err = classify_failure(ClientError::Api("forbidden".to_string()), &target, None);
        assert!(matches!(err, ClientError::Api(_)));
    }

    #[test]
    fn test_parse_list() {
        let raw = br#"{"apiVersion":"v1","kind":"List","items":[{
            "apiVersion":"snapshot.storage.k8s.io/v1","kind":"VolumeSnapshot",
            "metadata":{"name":"data-1","namespace":"team-a"},
            "spec":{"source":{"persistentVolumeClaimName":"data"}},
            "status":{"boundVolumeSnapshotContentName":"snapcontent-1","readyToUse":true}}]}"#;
        let list: ObjectList<VolumeSnapshot> = serde_json::from_slice(raw).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].bound_content_name(), Some("snapcontent-1"));
        assert!(list.items[0].is_ready());
    }
}
