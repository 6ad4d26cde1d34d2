use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::retention::ANNOTATION_ENV_CONFIG;

pub const DEFAULT_NAME_TEMPLATE: &str = "{pvcName}-{timestamp}-{rand}";

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Expand `{pvcName}`, `{timestamp}` (`YYYY-MM-DD-HHMMSS`) and `{rand}`.
pub fn render_snapshot_name(template: &str, pvc_name: &str, rand: &str, now: DateTime<Utc>) -> String {
    let timestamp = now.format("%Y-%m-%d-%H%M%S").to_string();
    template
        .replace("{pvcName}", pvc_name)
        .replace("{timestamp}", &timestamp)
        .replace("{rand}", rand)
}

/// `n` characters from `[a-z0-9]`, valid in any object name.
pub fn random_suffix(n: usize) -> String {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// The `BAK_*` variables worth recording on a snapshot. Anything that looks
/// like a secret is left out.
pub fn collect_bak_env<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| key.starts_with("BAK_") && !key.contains("PASSWORD"))
        .collect()
}

/// Annotation set holding one `KEY='value'` line per variable, sorted by key.
pub fn env_config_annotation(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let lines: Vec<String> = vars
        .iter()
        .map(|(key, value)| format!("{key}='{value}'"))
        .collect();
    BTreeMap::from([(ANNOTATION_ENV_CONFIG.to_string(), lines.join("\n"))])
}
