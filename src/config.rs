//! Run configuration with builder pattern

use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::session::resolve_uri;

/// What to do when an existing resource no longer matches its desired definition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// The live definition wins; only activation and autostart are fixed
    #[default]
    Ignore,
    /// Redefine in place from the freshly rendered definition
    Redefine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Hypervisor identifier, e.g. `qemu` or `kvm`
    pub hypervisor: String,
    /// Directory holding `<kind>.xml.jinja2` templates
    pub template_dir: PathBuf,
    /// Root of the generated definitions tree
    pub output_dir: PathBuf,
    /// Desired-state YAML document
    pub values_path: PathBuf,
    pub drift: DriftPolicy,
}

pub const DEFAULT_HYPERVISOR: &str = "qemu";

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            hypervisor: DEFAULT_HYPERVISOR.to_string(),
            template_dir: PathBuf::from("templates"),
            output_dir: PathBuf::from("generated"),
            values_path: PathBuf::from("values.yml"),
            drift: DriftPolicy::Ignore,
        }
    }
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.hypervisor.trim().is_empty() {
            return Err(crate::Error::Config("hypervisor cannot be empty".into()));
        }
        resolve_uri(&self.hypervisor)?;
        if self.template_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("template_dir cannot be empty".into()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("output_dir cannot be empty".into()));
        }
        Ok(())
    }

    /// Connection URI for the configured hypervisor
    pub fn uri(&self) -> crate::Result<&'static str> {
        resolve_uri(&self.hypervisor)
    }
}

#[derive(Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn hypervisor(mut self, hypervisor: impl Into<String>) -> Self {
        self.config.hypervisor = hypervisor.into();
        self
    }

    pub fn template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.template_dir = path.into();
        self
    }

    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_dir = path.into();
        self
    }

    pub fn values_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.values_path = path.into();
        self
    }

    pub fn drift(mut self, policy: DriftPolicy) -> Self {
        self.config.drift = policy;
        self
    }

    pub fn build(self) -> RunConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<RunConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
