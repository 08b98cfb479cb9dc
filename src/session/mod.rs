//! Hypervisor session abstraction
//!
//! The reconciler only talks to the hypervisor through [`Session`]. Backends:
//!
//! - [`memory::MemorySession`] keeps resources in process and follows the
//!   libvirt network lifecycle rules. It records every mutating call, which
//!   makes it the backend of choice for tests.
//! - `libvirt::LibvirtSession` (feature `libvirt`) talks to a real
//!   QEMU/KVM daemon through the `virt` bindings.

pub mod memory;
#[cfg(feature = "libvirt")]
pub mod libvirt;

use std::collections::BTreeSet;
use std::fmt;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};

/// System-level QEMU/KVM connection URI
pub const QEMU_SYSTEM_URI: &str = "qemu:///system";

/// Resource categories a session can manage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
}

impl ResourceKind {
    /// Key used for this kind in the desired-state document and output tree
    pub fn key(&self) -> &'static str {
        match self {
            ResourceKind::Network => "networks",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "networks" => Some(ResourceKind::Network),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Reference to a resource known to the hypervisor.
///
/// Backends resolve the handle by name on every call, so a resource removed
/// behind our back surfaces as [`Error::NotFound`] rather than a dangling
/// pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn not_found(&self) -> Error {
        Error::NotFound {
            kind: self.kind.to_string(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Capabilities the reconciler needs from a hypervisor connection
#[cfg_attr(test, mockall::automock)]
pub trait Session {
    /// Names of running resources
    fn list_active(&self, kind: ResourceKind) -> Result<BTreeSet<String>>;

    /// Names of defined but inactive resources
    fn list_defined(&self, kind: ResourceKind) -> Result<BTreeSet<String>>;

    /// Look up a resource by name, `None` when it does not exist
    fn lookup(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceHandle>>;

    fn is_active(&self, handle: &ResourceHandle) -> Result<bool>;

    fn autostart(&self, handle: &ResourceHandle) -> Result<bool>;

    fn set_autostart(&self, handle: &ResourceHandle, enabled: bool) -> Result<()>;

    fn start(&self, handle: &ResourceHandle) -> Result<()>;

    fn stop(&self, handle: &ResourceHandle) -> Result<()>;

    /// Define (or redefine) a resource from its serialized definition.
    /// Redefining an existing name requires the definition to carry the
    /// resource's current `<uuid>`.
    fn define(&self, kind: ResourceKind, definition: &str) -> Result<ResourceHandle>;

    fn undefine(&self, handle: &ResourceHandle) -> Result<()>;

    /// Live definition text of a resource
    fn definition(&self, handle: &ResourceHandle) -> Result<String>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Opens sessions for a connection URI
pub trait Connector {
    fn open(&self, uri: &str) -> Result<Box<dyn Session>>;
}

/// Map a hypervisor identifier to its connection URI (case-insensitive)
pub fn resolve_uri(hypervisor: &str) -> Result<&'static str> {
    match hypervisor.to_ascii_lowercase().as_str() {
        "qemu" | "kvm" => Ok(QEMU_SYSTEM_URI),
        _ => Err(Error::UnsupportedHypervisor(hypervisor.to_string())),
    }
}

/// Trimmed text of the first `<tag>` element, `None` when missing or empty
pub(crate) fn element_text<'a>(definition: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let start = definition.find(&open)? + open.len();
    let end = definition[start..].find(&format!("</{tag}>"))? + start;
    let text = definition[start..end].trim();
    (!text.is_empty()).then_some(text)
}

/// Pin a definition to an existing identity by adding `<uuid>` after `<name>`.
/// Definitions that already carry a uuid are returned unchanged.
pub(crate) fn with_uuid(definition: &str, uuid: &str) -> String {
    if element_text(definition, "uuid").is_some() {
        return definition.to_string();
    }
    match definition.find("</name>") {
        Some(pos) => {
            let at = pos + "</name>".len();
            format!("{}\n  <uuid>{uuid}</uuid>{}", &definition[..at], &definition[at..])
        }
        None => definition.to_string(),
    }
}

/// Connector for the backend compiled into this build
pub fn default_connector() -> Box<dyn Connector> {
    #[cfg(feature = "libvirt")]
    {
        Box::new(libvirt::LibvirtConnector)
    }
    #[cfg(not(feature = "libvirt"))]
    {
        Box::new(UnavailableConnector)
    }
}

/// Stand-in used when the crate is built without a hypervisor backend
#[cfg(not(feature = "libvirt"))]
struct UnavailableConnector;

#[cfg(not(feature = "libvirt"))]
impl Connector for UnavailableConnector {
    fn open(&self, uri: &str) -> Result<Box<dyn Session>> {
        Err(Error::Connection {
            uri: uri.to_string(),
            reason: "built without the `libvirt` feature".into(),
        })
    }
}
