// Re-export dependencies used in public interfaces of common types

use std::time::Duration;

pub use serde::{Deserialize, Serialize};
pub use serde_json;
use thiserror::Error;

mod client;
mod resources;
mod selector;

pub use client::ResourceClient;
pub use resources::*;
pub use selector::{LabelRequirement, LabelSelector, Scope};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    Conflict { kind: ResourceKind, name: String },

    #[error("timed out after {timeout:?} waiting for {kind} {name}: {message}")]
    Timeout {
        kind: ResourceKind,
        name: String,
        timeout: Duration,
        message: String,
    },

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn not_found(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        ClientError::NotFound {
            kind,
            name: qualified_name(namespace, name),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }
}

/// `namespace/name` for namespaced objects, `name` otherwise.
pub fn qualified_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

// Define the primary Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClientError>;
