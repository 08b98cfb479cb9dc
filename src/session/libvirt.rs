//! libvirt backend built on the `virt` bindings

use std::collections::BTreeSet;
use virt::connect::Connect;
use virt::error::ErrorNumber;
use virt::network::Network;
use crate::session::{Connector, ResourceHandle, ResourceKind, Session};
use crate::{Error, Result};

/// Opens libvirt connections
pub struct LibvirtConnector;

impl Connector for LibvirtConnector {
    fn open(&self, uri: &str) -> Result<Box<dyn Session>> {
        let conn = Connect::open(Some(uri)).map_err(|e| Error::Connection {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(uri = %uri, "Connected to hypervisor");
        Ok(Box::new(LibvirtSession {
            conn: Some(conn),
            uri: uri.to_string(),
        }))
    }
}

/// Live connection to a libvirt daemon
pub struct LibvirtSession {
    conn: Option<Connect>,
    uri: String,
}

impl LibvirtSession {
    fn conn(&self) -> Result<&Connect> {
        self.conn.as_ref().ok_or_else(|| Error::Connection {
            uri: self.uri.clone(),
            reason: "connection already closed".into(),
        })
    }

    fn network(&self, handle: &ResourceHandle) -> Result<Network> {
        match handle.kind {
            ResourceKind::Network => Network::lookup_by_name(self.conn()?, &handle.name).map_err(|e| {
                if matches!(e.code(), ErrorNumber::NoNetwork) {
                    handle.not_found()
                } else {
                    hypervisor_error("lookup", &e)
                }
            }),
        }
    }
}

fn hypervisor_error(operation: &str, err: &virt::error::Error) -> Error {
    Error::Hypervisor {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
}

impl Session for LibvirtSession {
    fn list_active(&self, kind: ResourceKind) -> Result<BTreeSet<String>> {
        match kind {
            ResourceKind::Network => Ok(self
                .conn()?
                .list_networks()
                .map_err(|e| hypervisor_error("list active networks", &e))?
                .into_iter()
                .collect()),
        }
    }

    fn list_defined(&self, kind: ResourceKind) -> Result<BTreeSet<String>> {
        match kind {
            ResourceKind::Network => Ok(self
                .conn()?
                .list_defined_networks()
                .map_err(|e| hypervisor_error("list defined networks", &e))?
                .into_iter()
                .collect()),
        }
    }

    fn lookup(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceHandle>> {
        let handle = ResourceHandle::new(kind, name);
        match self.network(&handle) {
            Ok(_) => Ok(Some(handle)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_active(&self, handle: &ResourceHandle) -> Result<bool> {
        self.network(handle)?
            .is_active()
            .map_err(|e| hypervisor_error("is_active", &e))
    }

    fn autostart(&self, handle: &ResourceHandle) -> Result<bool> {
        self.network(handle)?
            .get_autostart()
            .map_err(|e| hypervisor_error("get_autostart", &e))
    }

    fn set_autostart(&self, handle: &ResourceHandle, enabled: bool) -> Result<()> {
        self.network(handle)?
            .set_autostart(enabled)
            .map_err(|e| hypervisor_error("set_autostart", &e))?;
        Ok(())
    }

    fn start(&self, handle: &ResourceHandle) -> Result<()> {
        self.network(handle)?.create().map_err(|e| Error::Start {
            kind: handle.kind.to_string(),
            name: handle.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn stop(&self, handle: &ResourceHandle) -> Result<()> {
        self.network(handle)?.destroy().map_err(|e| Error::Stop {
            kind: handle.kind.to_string(),
            name: handle.name.clone(),
            reason: e.to_string(),
        })
    }

    fn define(&self, kind: ResourceKind, definition: &str) -> Result<ResourceHandle> {
        match kind {
            ResourceKind::Network => {
                let net = Network::define_xml(self.conn()?, definition).map_err(|e| Error::Define {
                    kind: kind.to_string(),
                    name: "<from definition>".into(),
                    reason: e.to_string(),
                })?;
                let name = net
                    .get_name()
                    .map_err(|e| hypervisor_error("get_name", &e))?;
                Ok(ResourceHandle::new(kind, name))
            }
        }
    }

    fn undefine(&self, handle: &ResourceHandle) -> Result<()> {
        self.network(handle)?.undefine().map_err(|e| Error::Undefine {
            kind: handle.kind.to_string(),
            name: handle.name.clone(),
            reason: e.to_string(),
        })
    }

    fn definition(&self, handle: &ResourceHandle) -> Result<String> {
        self.network(handle)?
            .get_xml_desc(0)
            .map_err(|e| hypervisor_error("get_xml_desc", &e))
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                tracing::warn!(uri = %self.uri, error = %e, "Failed to close hypervisor connection");
            }
        }
    }
}

impl Drop for LibvirtSession {
    fn drop(&mut self) {
        self.close();
    }
}
