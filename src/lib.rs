//! Declarative virtual network provisioning
//!
//! Reconciles a YAML desired-state document against a QEMU/KVM hypervisor:
//! every declared resource is defined from a rendered template, started and
//! marked for autostart, or torn down again. Runs are idempotent, so a run
//! that failed halfway is finished by simply running it again.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use virtinfra::{DesiredState, Orchestrator, RunConfig};
//!
//! let config = RunConfig::builder()
//!     .hypervisor("kvm")
//!     .template_dir("templates")
//!     .output_dir("generated")
//!     .build_validated()?;
//!
//! let desired = DesiredState::load(Path::new("values.yml"))?;
//! let connector = virtinfra::session::default_connector();
//!
//! Orchestrator::scoped(config, connector.as_ref(), |orch| {
//!     orch.create_infra(&desired)
//! })?;
//! # Ok::<(), virtinfra::Error>(())
//! ```

pub mod config;
pub mod desired;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod render;
pub mod session;

pub use config::{DriftPolicy, RunConfig};
pub use desired::{DesiredState, ResourceSpec};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, Registry, RunReport};
pub use reconcile::{Action, DefinitionReconciler, Reconcile, ResourceState};
pub use render::Renderer;
pub use session::{resolve_uri, Connector, ResourceHandle, ResourceKind, Session};
