//! Error types for virtinfra

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to open {uri}: {reason}")]
    Connection { uri: String, reason: String },

    #[error("Unsupported hypervisor: {0}")]
    UnsupportedHypervisor(String),

    #[error("Values file not found: {}", .0.display())]
    ValuesNotFound(PathBuf),

    #[error("Invalid desired state: {0}")]
    DesiredState(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Template {template} references a field missing from {resource}: {detail}")]
    MissingField {
        template: String,
        resource: String,
        detail: String,
    },

    #[error("Template error in {template}: {detail}")]
    Template { template: String, detail: String },

    #[error("Rendered definition missing at {}: {source}", .path.display())]
    MissingArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to define {kind} {name}: {reason}")]
    Define {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Failed to start {kind} {name}: {reason}")]
    Start {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Failed to stop {kind} {name}: {reason}")]
    Stop {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Failed to undefine {kind} {name}: {reason}")]
    Undefine {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("Hypervisor contract violated: {0}")]
    Invariant(String),

    #[error("Output directory not empty: {}", .0.display())]
    DirectoryNotEmpty(PathBuf),

    #[error("Unsupported resource kind: {0}")]
    UnsupportedKind(String),

    #[error("{} of the declared {kind} failed: {}", .failures.len(), summarize(.failures))]
    Reconcile {
        kind: String,
        failures: Vec<ResourceFailure>,
    },

    #[error("Hypervisor error during {operation}: {reason}")]
    Hypervisor { operation: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single resource that could not be reconciled, kept for the run summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceFailure {
    pub resource: String,
    pub operation: String,
    pub cause: String,
}

fn summarize(failures: &[ResourceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}: {})", f.resource, f.operation, f.cause))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Fatal errors abort the whole run instead of only the current resource.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::UnsupportedHypervisor(_)
                | Error::Invariant(_)
                | Error::MissingField { .. }
                | Error::Template { .. }
                | Error::UnsupportedKind(_)
        )
    }

    /// Convert a template engine error, splitting out undefined field references
    pub fn from_template(err: &minijinja::Error, template: &str, resource: &str) -> Self {
        match err.kind() {
            minijinja::ErrorKind::UndefinedError => Error::MissingField {
                template: template.to_string(),
                resource: resource.to_string(),
                detail: err.to_string(),
            },
            _ => Error::Template {
                template: template.to_string(),
                detail: err.to_string(),
            },
        }
    }
}
