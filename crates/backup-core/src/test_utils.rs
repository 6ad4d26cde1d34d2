/// Test utilities for conditional test execution
use std::process::Command;

/// True when `kubectl` is installed and the current context serves the
/// snapshot API group.
pub fn has_kubectl() -> bool {
    Command::new("kubectl")
        .args([
            "api-resources",
            "--api-group=snapshot.storage.k8s.io",
            "-o",
            "name",
        ])
        .output()
        .map(|output| output.status.success() && !output.stdout.is_empty())
        .unwrap_or(false)
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_kubectl {
    () => {
        if !$crate::test_utils::has_kubectl() {
            eprintln!("Test ignored: kubectl with snapshot.storage.k8s.io not available");
            return;
        }
    };
}
