use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Labels;

/// Where a list call looks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Namespace(String),
    AllNamespaces,
}

impl Scope {
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            Scope::Namespace(ns) => ns == namespace,
            Scope::AllNamespaces => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelRequirement {
    Exists(String),
    Equals(String, String),
}

/// Equality-based label selector; all requirements must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(LabelRequirement::Exists(key.into()));
        self
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(LabelRequirement::Equals(key.into(), value.into()));
        self
    }

    pub fn requirements(&self) -> &[LabelRequirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|req| match req {
            LabelRequirement::Exists(key) => labels.contains_key(key),
            LabelRequirement::Equals(key, value) => labels.get(key) == Some(value),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                LabelRequirement::Exists(key) => key.clone(),
                LabelRequirement::Equals(key, value) => format!("{key}={value}"),
            })
            .collect();
        f.write_str(&rendered.join(","))
    }
}
