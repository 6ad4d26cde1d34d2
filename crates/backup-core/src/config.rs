//! Job configuration read from `BAK_*` variables.
//!
//! Bad values never abort loading: they are logged and replaced by the
//! default. [`BackupConfig::validate`] catches combinations that cannot work.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::flock::default_lock_count;
use crate::naming::{random_suffix, DEFAULT_NAME_TEMPLATE};
use crate::retention::RetentionPolicy;
use crate::{BackupError, Result};

/// Labels a job puts on its snapshot besides the period labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Value of the `type` label, e.g. `adhoc` or `cronjob`. Informational only.
    pub kind: String,
    /// Value of the `pod` label; omitted when empty.
    pub pod: String,
    pub retain: RetentionPolicy,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            kind: "adhoc".to_string(),
            pod: String::new(),
            retain: RetentionPolicy::DailyWeeklyMonthly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub enabled: bool,
    /// Number of lock files, i.e. how many jobs may run at once per node.
    pub count: usize,
    pub dir: PathBuf,
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: default_lock_count(),
            dir: PathBuf::from("/mnt/host-backup-locks"),
            timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub dry_run: bool,
    pub namespace: String,
    pub pvc_name: String,
    /// Random part of the snapshot name.
    pub vs_rand: String,
    pub label: LabelConfig,
    pub name_template: String,
    /// Snapshot class; empty means the cluster default. The class should
    /// carry the `Retain` deletion policy.
    pub class_name: String,
    pub wait_until_ready: bool,
    pub wait_timeout: Duration,
    pub lock: LockConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            namespace: "default".to_string(),
            pvc_name: "data".to_string(),
            vs_rand: random_suffix(6),
            label: LabelConfig::default(),
            name_template: DEFAULT_NAME_TEMPLATE.to_string(),
            class_name: "a3cloud-csi-gce-pd".to_string(),
            wait_until_ready: true,
            wait_timeout: Duration::from_secs(15 * 60),
            lock: LockConfig::default(),
        }
    }
}

impl BackupConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let retain_days = env.parsed("BAK_LABEL_VS_RETAIN_DAYS", 30u32);
        let retain = match env.raw("BAK_LABEL_VS_RETAIN").as_deref() {
            None | Some("daily_weekly_monthly") => RetentionPolicy::DailyWeeklyMonthly,
            Some("days") => RetentionPolicy::Days { count: retain_days },
            Some(other) => {
                warn!(
                    key = "BAK_LABEL_VS_RETAIN",
                    value = other,
                    "Value is not allowed, falling back to daily_weekly_monthly"
                );
                RetentionPolicy::DailyWeeklyMonthly
            }
        };

        Self {
            dry_run: env.flag("BAK_DRY_RUN", defaults.dry_run),
            namespace: env.string("BAK_NAMESPACE", defaults.namespace),
            pvc_name: env.string("BAK_PVC_NAME", defaults.pvc_name),
            vs_rand: env.string("BAK_VS_RAND", defaults.vs_rand),
            label: LabelConfig {
                kind: env.string("BAK_LABEL_VS_TYPE", defaults.label.kind),
                pod: env.string("BAK_LABEL_VS_POD", defaults.label.pod),
                retain,
            },
            name_template: env.string("BAK_VS_NAME_TEMPLATE", defaults.name_template),
            class_name: env.string("BAK_VS_CLASS_NAME", defaults.class_name),
            wait_until_ready: env.flag("BAK_VS_WAIT_UNTIL_READY", defaults.wait_until_ready),
            wait_timeout: env.duration("BAK_VS_WAIT_UNTIL_READY_TIMEOUT", defaults.wait_timeout),
            lock: LockConfig {
                enabled: env.flag("BAK_FLOCK", defaults.lock.enabled),
                count: env.parsed("BAK_FLOCK_COUNT", defaults.lock.count),
                dir: env
                    .raw("BAK_FLOCK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.lock.dir),
                timeout: Duration::from_secs(
                    env.parsed("BAK_FLOCK_TIMEOUT_SEC", defaults.lock.timeout.as_secs()),
                ),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(BackupError::Config("namespace must not be empty".to_string()));
        }
        if self.pvc_name.is_empty() {
            return Err(BackupError::Config("pvc name must not be empty".to_string()));
        }
        if self.name_template.trim().is_empty() {
            return Err(BackupError::Config(
                "snapshot name template must not be empty".to_string(),
            ));
        }
        if self.lock.enabled && self.lock.count == 0 {
            return Err(BackupError::Config(
                "BAK_FLOCK_COUNT must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn class_name(&self) -> Option<String> {
        Some(self.class_name.clone()).filter(|c| !c.is_empty())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, value = %raw, error = %e, "Unparseable value, using default");
                default
            }
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        parse_bool(raw.trim()).unwrap_or_else(|| {
            warn!(key, value = %raw, "Unparseable bool, using default");
            default
        })
    }

    fn duration(&self, key: &str, default: Duration) -> Duration {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        humantime::parse_duration(raw.trim()).unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "Unparseable duration, using default");
            default
        })
    }
}

/// Accepts the same spellings shell scripts commonly use for booleans.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
