//! In-process hypervisor model

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use parking_lot::RwLock;
use crate::session::{element_text, with_uuid, Connector, ResourceHandle, ResourceKind, Session};
use crate::{Error, Result};

/// A mutating call observed by a [`MemorySession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Define(ResourceKind, String),
    Start(String),
    Stop(String),
    SetAutostart(String, bool),
    Undefine(String),
}

#[derive(Debug, Clone)]
struct Resource {
    uuid: uuid::Uuid,
    definition: String,
    active: bool,
    autostart: bool,
}

#[derive(Default)]
struct State {
    resources: HashMap<ResourceKind, BTreeMap<String, Resource>>,
    calls: Vec<Call>,
    failing_starts: BTreeSet<String>,
    opens: usize,
    closed: bool,
}

/// Hypervisor kept in memory.
///
/// Clones share the same state, so a test can hand one clone to the
/// orchestrator and inspect the other afterwards.
#[derive(Clone, Default)]
pub struct MemorySession {
    state: Arc<RwLock<State>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resource without recording a call
    pub fn insert(&self, kind: ResourceKind, name: &str, definition: &str, active: bool, autostart: bool) {
        self.state.write().resources.entry(kind).or_default().insert(
            name.to_string(),
            Resource {
                uuid: uuid::Uuid::new_v4(),
                definition: definition.to_string(),
                active,
                autostart,
            },
        );
    }

    /// Remove a resource without recording a call, as another client would
    pub fn remove_external(&self, kind: ResourceKind, name: &str) {
        if let Some(resources) = self.state.write().resources.get_mut(&kind) {
            resources.remove(name);
        }
    }

    /// Make every `start` of `name` fail
    pub fn fail_start(&self, name: &str) {
        self.state.write().failing_starts.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.read().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.write().calls.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// How many sessions were opened through the [`Connector`] impl
    pub fn open_count(&self) -> usize {
        self.state.read().opens
    }

    pub fn uuid(&self, kind: ResourceKind, name: &str) -> Option<uuid::Uuid> {
        self.state
            .read()
            .resources
            .get(&kind)
            .and_then(|r| r.get(name))
            .map(|r| r.uuid)
    }

    /// `(active, autostart)` of a resource, `None` when undefined
    pub fn status(&self, kind: ResourceKind, name: &str) -> Option<(bool, bool)> {
        self.state
            .read()
            .resources
            .get(&kind)
            .and_then(|r| r.get(name))
            .map(|r| (r.active, r.autostart))
    }

    fn with_resource<T>(&self, handle: &ResourceHandle, f: impl FnOnce(&mut Resource) -> T) -> Result<T> {
        let mut state = self.state.write();
        state
            .resources
            .get_mut(&handle.kind)
            .and_then(|r| r.get_mut(&handle.name))
            .map(f)
            .ok_or_else(|| handle.not_found())
    }

    fn record(&self, call: Call) {
        self.state.write().calls.push(call);
    }

    fn names(&self, kind: ResourceKind, active: bool) -> BTreeSet<String> {
        self.state
            .read()
            .resources
            .get(&kind)
            .map(|r| {
                r.iter()
                    .filter(|(_, res)| res.active == active)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Session for MemorySession {
    fn list_active(&self, kind: ResourceKind) -> Result<BTreeSet<String>> {
        Ok(self.names(kind, true))
    }

    fn list_defined(&self, kind: ResourceKind) -> Result<BTreeSet<String>> {
        Ok(self.names(kind, false))
    }

    fn lookup(&self, kind: ResourceKind, name: &str) -> Result<Option<ResourceHandle>> {
        let state = self.state.read();
        Ok(state
            .resources
            .get(&kind)
            .filter(|r| r.contains_key(name))
            .map(|_| ResourceHandle::new(kind, name)))
    }

    fn is_active(&self, handle: &ResourceHandle) -> Result<bool> {
        self.with_resource(handle, |r| r.active)
    }

    fn autostart(&self, handle: &ResourceHandle) -> Result<bool> {
        self.with_resource(handle, |r| r.autostart)
    }

    fn set_autostart(&self, handle: &ResourceHandle, enabled: bool) -> Result<()> {
        self.with_resource(handle, |r| r.autostart = enabled)?;
        self.record(Call::SetAutostart(handle.name.clone(), enabled));
        Ok(())
    }

    fn start(&self, handle: &ResourceHandle) -> Result<()> {
        let failing = self.state.read().failing_starts.contains(&handle.name);
        let already_active = self.is_active(handle)?;
        self.record(Call::Start(handle.name.clone()));

        if failing {
            return Err(Error::Start {
                kind: handle.kind.to_string(),
                name: handle.name.clone(),
                reason: "activation rejected".into(),
            });
        }
        if already_active {
            return Err(Error::Start {
                kind: handle.kind.to_string(),
                name: handle.name.clone(),
                reason: "already active".into(),
            });
        }
        self.with_resource(handle, |r| r.active = true)
    }

    fn stop(&self, handle: &ResourceHandle) -> Result<()> {
        if !self.is_active(handle)? {
            return Err(Error::Stop {
                kind: handle.kind.to_string(),
                name: handle.name.clone(),
                reason: "not active".into(),
            });
        }
        self.with_resource(handle, |r| r.active = false)?;
        self.record(Call::Stop(handle.name.clone()));
        Ok(())
    }

    fn define(&self, kind: ResourceKind, definition: &str) -> Result<ResourceHandle> {
        let name = definition_name(definition).ok_or_else(|| Error::Define {
            kind: kind.to_string(),
            name: "<unnamed>".into(),
            reason: "definition has no <name> element".into(),
        })?;
        let requested = match element_text(definition, "uuid") {
            Some(text) => Some(text.parse::<uuid::Uuid>().map_err(|e| Error::Define {
                kind: kind.to_string(),
                name: name.clone(),
                reason: format!("invalid uuid {text}: {e}"),
            })?),
            None => None,
        };

        let mut state = self.state.write();
        state.calls.push(Call::Define(kind, definition.to_string()));
        let resources = state.resources.entry(kind).or_default();
        match resources.get_mut(&name) {
            // Same name is only accepted for the same identity
            Some(existing) if requested != Some(existing.uuid) => {
                return Err(Error::Define {
                    kind: kind.to_string(),
                    name: name.clone(),
                    reason: format!("{kind} '{name}' already exists with uuid {}", existing.uuid),
                });
            }
            Some(existing) => existing.definition = definition.to_string(),
            None => {
                resources.insert(
                    name.clone(),
                    Resource {
                        uuid: requested.unwrap_or_else(uuid::Uuid::new_v4),
                        definition: definition.to_string(),
                        active: false,
                        autostart: false,
                    },
                );
            }
        }
        Ok(ResourceHandle::new(kind, name))
    }

    fn undefine(&self, handle: &ResourceHandle) -> Result<()> {
        let mut state = self.state.write();
        let removed = state
            .resources
            .get_mut(&handle.kind)
            .and_then(|r| r.remove(&handle.name));
        if removed.is_none() {
            return Err(handle.not_found());
        }
        state.calls.push(Call::Undefine(handle.name.clone()));
        Ok(())
    }

    fn definition(&self, handle: &ResourceHandle) -> Result<String> {
        self.with_resource(handle, |r| with_uuid(&r.definition, &r.uuid.to_string()))
    }

    fn close(&mut self) {
        self.state.write().closed = true;
    }
}

impl Connector for MemorySession {
    fn open(&self, _uri: &str) -> Result<Box<dyn Session>> {
        let mut state = self.state.write();
        state.opens += 1;
        state.closed = false;
        drop(state);
        Ok(Box::new(self.clone()))
    }
}

fn definition_name(definition: &str) -> Option<String> {
    element_text(definition, "name").map(str::to_string)
}
