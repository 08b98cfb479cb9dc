//! Reconciliation of declared resources against the hypervisor
//!
//! A resource moves through `Absent -> Defined -> Active(autostart)`.
//! Ensure-present drives it rightwards one step at a time and never skips
//! `Defined`; ensure-absent resets it to `Absent`. The hypervisor is the only
//! source of truth: the active and defined name sets are queried again before
//! every per-resource decision, because another client may have changed them
//! since the previous one.
//!
//! Runs are not transactional. A create that fails halfway leaves a defined
//! but inactive resource behind, which the next run picks up through the
//! existing-resource path and finishes.

use std::fmt;
use std::path::PathBuf;
use serde::Serialize;
use crate::config::DriftPolicy;
use crate::desired::ResourceSpec;
use crate::error::ResourceFailure;
use crate::render::Renderer;
use crate::session::{element_text, with_uuid, ResourceHandle, ResourceKind, Session};
use crate::{Error, Result};

/// Everything a reconciler needs for one pass
pub struct ReconcileContext<'a> {
    pub session: &'a dyn Session,
    pub renderer: &'a Renderer,
    pub drift: DriftPolicy,
}

/// Reconciliation logic for one resource kind
pub trait Reconcile {
    /// Key of the kind in the desired-state document
    fn kind_name(&self) -> &str;

    fn ensure_present(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindReport>;

    fn ensure_absent(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindReport>;

    /// Current state of every declared resource, without changing anything
    fn observe(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindStatus>;

    /// Write definitions for every spec without contacting the hypervisor
    fn render(&self, renderer: &Renderer, specs: &[ResourceSpec]) -> Result<Vec<PathBuf>>;
}

/// Lifecycle position of a single resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ResourceState {
    Absent,
    Defined { autostart: bool },
    Active { autostart: bool },
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Absent => write!(f, "absent"),
            ResourceState::Defined { autostart } => write!(f, "defined (autostart: {autostart})"),
            ResourceState::Active { autostart } => write!(f, "active (autostart: {autostart})"),
        }
    }
}

/// A corrective step applied to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Defined,
    Redefined,
    Started,
    AutostartEnabled,
    Stopped,
    Undefined,
    ArtifactRemoved,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    pub name: String,
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ResourceFailure>,
}

impl ResourceOutcome {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty() && self.failure.is_none()
    }
}

/// Result of one ensure-present or ensure-absent pass over a kind
#[derive(Debug, Clone, Serialize)]
pub struct KindReport {
    pub kind: String,
    pub resources: Vec<ResourceOutcome>,
    /// Set by ensure-absent once the kind's output directory is gone
    pub directory_removed: bool,
}

impl KindReport {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            resources: Vec::new(),
            directory_removed: false,
        }
    }

    pub fn failures(&self) -> Vec<ResourceFailure> {
        self.resources
            .iter()
            .filter_map(|r| r.failure.clone())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.resources.iter().any(|r| r.failure.is_some())
    }

    pub fn outcome(&self, name: &str) -> Option<&ResourceOutcome> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Turn isolated per-resource failures into an error for the whole kind
    pub fn into_result(self) -> Result<Self> {
        if self.has_failures() {
            Err(Error::Reconcile {
                kind: self.kind.clone(),
                failures: self.failures(),
            })
        } else {
            Ok(self)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub name: String,
    #[serde(flatten)]
    pub state: ResourceState,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindStatus {
    pub kind: String,
    pub resources: Vec<ResourceStatus>,
}

/// Reconciler for kinds whose resources are defined from a rendered template
pub struct DefinitionReconciler {
    kind: ResourceKind,
    template: String,
}

/// Template used for virtual networks
pub const NETWORK_TEMPLATE: &str = "network.xml.jinja2";

impl DefinitionReconciler {
    pub fn new(kind: ResourceKind, template: impl Into<String>) -> Self {
        Self {
            kind,
            template: template.into(),
        }
    }

    pub fn networks() -> Self {
        Self::new(ResourceKind::Network, NETWORK_TEMPLATE)
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the hypervisor knows `name`, from freshly listed name sets
    fn exists(&self, session: &dyn Session, name: &str) -> Result<bool> {
        let active = session.list_active(self.kind)?;
        let defined = session.list_defined(self.kind)?;
        Ok(active.contains(name) || defined.contains(name))
    }

    fn state(&self, session: &dyn Session, name: &str) -> Result<ResourceState> {
        if !self.exists(session, name)? {
            return Ok(ResourceState::Absent);
        }
        let Some(handle) = session.lookup(self.kind, name)? else {
            return Ok(ResourceState::Absent);
        };
        let autostart = session.autostart(&handle)?;
        if session.is_active(&handle)? {
            Ok(ResourceState::Active { autostart })
        } else {
            Ok(ResourceState::Defined { autostart })
        }
    }

    fn not_found(&self, name: &str) -> Error {
        Error::NotFound {
            kind: self.kind.to_string(),
            name: name.to_string(),
        }
    }

    /// A successful define must hand back the resource that was asked for
    fn check_defined(&self, handle: &ResourceHandle, name: &str) -> Result<()> {
        if handle.kind != self.kind || handle.name != name {
            return Err(Error::Invariant(format!(
                "defining {}/{name} returned a handle for {handle}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Render to disk, read the artifact back and define from it.
    /// A redefinition passes the live `uuid` so the hypervisor keeps the identity.
    fn define_from_artifact(
        &self,
        ctx: &ReconcileContext<'_>,
        spec: &ResourceSpec,
        text: Option<&str>,
        uuid: Option<&str>,
    ) -> Result<ResourceHandle> {
        let kind = self.kind.key();
        match text {
            Some(text) => ctx.renderer.write_artifact(kind, spec.name(), text)?,
            None => ctx.renderer.render(kind, &self.template, spec)?,
        };
        let mut definition = ctx.renderer.read_artifact(kind, spec.name())?;
        if let Some(uuid) = uuid {
            definition = with_uuid(&definition, uuid);
        }
        let handle = ctx.session.define(self.kind, &definition)?;
        self.check_defined(&handle, spec.name())?;
        Ok(handle)
    }

    fn create(&self, ctx: &ReconcileContext<'_>, spec: &ResourceSpec, actions: &mut Vec<Action>) -> Result<()> {
        let handle = self.define_from_artifact(ctx, spec, None, None)?;
        actions.push(Action::Defined);

        ctx.session.set_autostart(&handle, true)?;
        actions.push(Action::AutostartEnabled);

        ctx.session.start(&handle)?;
        actions.push(Action::Started);

        tracing::info!(kind = %self.kind, resource = %spec.name(), "Resource created");
        Ok(())
    }

    /// Redefine in place when the desired definition moved away from the last applied one
    fn correct_drift(
        &self,
        ctx: &ReconcileContext<'_>,
        spec: &ResourceSpec,
        handle: &ResourceHandle,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let kind = self.kind.key();
        let desired = ctx.renderer.render_text(&self.template, spec)?;

        let Some(applied) = ctx.renderer.existing_artifact(kind, spec.name())? else {
            ctx.renderer.write_artifact(kind, spec.name(), &desired)?;
            tracing::warn!(kind = %kind, resource = %spec.name(), "No applied definition on record, drift unknown");
            return Ok(());
        };
        if applied == desired {
            return Ok(());
        }

        let was_active = ctx.session.is_active(handle)?;
        let live = ctx.session.definition(handle)?;
        let uuid = element_text(&live, "uuid").ok_or_else(|| Error::Hypervisor {
            operation: "read definition".into(),
            reason: format!("live definition of {handle} has no <uuid>"),
        })?;
        let redefined = self.define_from_artifact(ctx, spec, Some(&desired), Some(uuid))?;
        actions.push(Action::Redefined);
        tracing::info!(kind = %kind, resource = %spec.name(), "Definition drifted, redefined");

        // The new definition only takes effect on the next activation
        if was_active {
            ctx.session.stop(&redefined)?;
            actions.push(Action::Stopped);
        }
        Ok(())
    }

    fn converge(&self, ctx: &ReconcileContext<'_>, spec: &ResourceSpec, actions: &mut Vec<Action>) -> Result<()> {
        let name = spec.name();
        if !self.exists(ctx.session, name)? {
            return self.create(ctx, spec, actions);
        }

        let handle = ctx
            .session
            .lookup(self.kind, name)?
            .ok_or_else(|| self.not_found(name))?;

        if ctx.drift == DriftPolicy::Redefine {
            self.correct_drift(ctx, spec, &handle, actions)?;
        }

        if !ctx.session.is_active(&handle)? {
            ctx.session.start(&handle)?;
            actions.push(Action::Started);
            tracing::info!(kind = %self.kind, resource = %name, "Existing resource was started");
        }

        if !ctx.session.autostart(&handle)? {
            ctx.session.set_autostart(&handle, true)?;
            actions.push(Action::AutostartEnabled);
            tracing::info!(kind = %self.kind, resource = %name, "Autostart enabled");
        }
        Ok(())
    }

    fn teardown(&self, ctx: &ReconcileContext<'_>, spec: &ResourceSpec, actions: &mut Vec<Action>) -> Result<()> {
        let name = spec.name();
        let handle = if self.exists(ctx.session, name)? {
            ctx.session.lookup(self.kind, name)?
        } else {
            None
        };

        match handle {
            Some(handle) => {
                if ctx.session.is_active(&handle)? {
                    ctx.session.stop(&handle)?;
                    actions.push(Action::Stopped);
                }
                ctx.session.undefine(&handle)?;
                actions.push(Action::Undefined);
                tracing::info!(kind = %self.kind, resource = %name, "Resource destroyed");
            }
            None => tracing::debug!(kind = %self.kind, resource = %name, "Already absent"),
        }

        if ctx.renderer.remove_artifact(self.kind.key(), name)? {
            actions.push(Action::ArtifactRemoved);
        }
        Ok(())
    }

    /// Run `step` for every spec, isolating non-fatal failures per resource
    fn each_spec<F>(&self, specs: &[ResourceSpec], phase: &str, mut step: F) -> Result<KindReport>
    where
        F: FnMut(&ResourceSpec, &mut Vec<Action>) -> Result<()>,
    {
        let mut report = KindReport::new(self.kind.key());
        for spec in specs {
            let mut actions = Vec::new();
            let failure = match step(spec, &mut actions) {
                Ok(()) => None,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(kind = %self.kind, resource = %spec.name(), phase = %phase, error = %e, "Reconciliation failed");
                    Some(ResourceFailure {
                        resource: spec.name().to_string(),
                        operation: operation_of(&e, phase),
                        cause: e.to_string(),
                    })
                }
            };
            report.resources.push(ResourceOutcome {
                name: spec.name().to_string(),
                actions,
                failure,
            });
        }
        Ok(report)
    }
}

/// Name of the operation an error came from, for the failure summary
fn operation_of(err: &Error, phase: &str) -> String {
    match err {
        Error::Define { .. } => "define".into(),
        Error::Start { .. } => "start".into(),
        Error::Stop { .. } => "stop".into(),
        Error::Undefine { .. } => "undefine".into(),
        Error::NotFound { .. } => "lookup".into(),
        Error::MissingArtifact { .. } => "read definition".into(),
        Error::Hypervisor { operation, .. } => operation.clone(),
        _ => phase.to_string(),
    }
}

impl Reconcile for DefinitionReconciler {
    fn kind_name(&self) -> &str {
        self.kind.key()
    }

    fn ensure_present(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindReport> {
        // Catch incomplete records before anything on the hypervisor changes
        for spec in specs {
            ctx.renderer.render_text(&self.template, spec)?;
        }

        self.each_spec(specs, "ensure present", |spec, actions| {
            tracing::info!(kind = %self.kind, resource = %spec.name(), "Reconciling");
            self.converge(ctx, spec, actions)
        })
    }

    fn ensure_absent(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindReport> {
        let mut report = self.each_spec(specs, "ensure absent", |spec, actions| {
            self.teardown(ctx, spec, actions)
        })?;

        match ctx.renderer.remove_kind_dir(self.kind.key()) {
            Ok(()) => report.directory_removed = true,
            // The failing resources already explain the leftovers
            Err(e) if report.has_failures() => {
                tracing::warn!(kind = %self.kind, error = %e, "Output directory kept");
            }
            Err(e) => return Err(e),
        }
        Ok(report)
    }

    fn observe(&self, ctx: &ReconcileContext<'_>, specs: &[ResourceSpec]) -> Result<KindStatus> {
        let resources = specs
            .iter()
            .map(|spec| {
                Ok(ResourceStatus {
                    name: spec.name().to_string(),
                    state: self.state(ctx.session, spec.name())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(KindStatus {
            kind: self.kind.key().to_string(),
            resources,
        })
    }

    fn render(&self, renderer: &Renderer, specs: &[ResourceSpec]) -> Result<Vec<PathBuf>> {
        specs
            .iter()
            .map(|spec| renderer.render(self.kind.key(), &self.template, spec))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::desired::DesiredState;
    use crate::session::memory::{Call, MemorySession};
    use crate::session::MockSession;
    use tempfile::TempDir;

    const TEMPLATE: &str = "<network>\n  <name>{{ name }}</name>\n  <bridge name='{{ bridge }}'/>\n</network>\n";

    fn setup() -> (MemorySession, Renderer, TempDir) {
        let temp = TempDir::new().unwrap();
        let templates = temp.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join(NETWORK_TEMPLATE), TEMPLATE).unwrap();
        let renderer = Renderer::new(&templates, temp.path().join("generated"));
        (MemorySession::new(), renderer, temp)
    }

    fn ctx<'a>(session: &'a dyn Session, renderer: &'a Renderer) -> ReconcileContext<'a> {
        ReconcileContext {
            session,
            renderer,
            drift: DriftPolicy::Ignore,
        }
    }

    fn networks(yaml: &str) -> Vec<ResourceSpec> {
        DesiredState::parse(yaml).unwrap().get("networks").unwrap().to_vec()
    }

    fn net_a() -> Vec<ResourceSpec> {
        networks("networks:\n  - name: net-a\n    bridge: virbr10\n")
    }

    #[test]
    fn test_create_on_empty_hypervisor() {
        let (session, renderer, temp) = setup();
        let reconciler = DefinitionReconciler::networks();

        let report = reconciler.ensure_present(&ctx(&session, &renderer), &net_a()).unwrap();

        let artifact = temp.path().join("generated/networks/net-a.xml");
        let text = std::fs::read_to_string(&artifact).unwrap();
        assert_eq!(
            session.calls(),
            vec![
                Call::Define(ResourceKind::Network, text),
                Call::SetAutostart("net-a".into(), true),
                Call::Start("net-a".into()),
            ]
        );
        assert_eq!(
            report.outcome("net-a").unwrap().actions,
            vec![Action::Defined, Action::AutostartEnabled, Action::Started]
        );
        assert_eq!(
            session.status(ResourceKind::Network, "net-a"),
            Some((true, true))
        );
    }

    #[test]
    fn test_second_run_is_noop() {
        let (session, renderer, _temp) = setup();
        let reconciler = DefinitionReconciler::networks();
        let specs = net_a();

        reconciler.ensure_present(&ctx(&session, &renderer), &specs).unwrap();
        session.clear_calls();

        let report = reconciler.ensure_present(&ctx(&session, &renderer), &specs).unwrap();
        assert!(session.calls().is_empty());
        assert!(report.outcome("net-a").unwrap().is_noop());
    }

    #[test]
    fn test_converge_defined_inactive() {
        let (session, renderer, temp) = setup();
        session.insert(ResourceKind::Network, "net-a", "<network><name>net-a</name></network>", false, false);

        let reconciler = DefinitionReconciler::networks();
        reconciler.ensure_present(&ctx(&session, &renderer), &net_a()).unwrap();

        assert_eq!(
            session.calls(),
            vec![
                Call::Start("net-a".into()),
                Call::SetAutostart("net-a".into(), true),
            ]
        );
        // Existing resources are not re-rendered
        assert!(!temp.path().join("generated/networks/net-a.xml").exists());
    }

    #[test]
    fn test_active_without_autostart() {
        let (session, renderer, _temp) = setup();
        session.insert(ResourceKind::Network, "net-a", "<network><name>net-a</name></network>", true, false);

        let reconciler = DefinitionReconciler::networks();
        reconciler.ensure_present(&ctx(&session, &renderer), &net_a()).unwrap();

        assert_eq!(session.calls(), vec![Call::SetAutostart("net-a".into(), true)]);
    }

    #[test]
    fn test_missing_field_aborts_before_mutation() {
        let (session, renderer, temp) = setup();
        let specs = networks("networks:\n  - name: net-a\n    bridge: virbr10\n  - name: net-b\n");

        let reconciler = DefinitionReconciler::networks();
        let result = reconciler.ensure_present(&ctx(&session, &renderer), &specs);

        assert!(matches!(result, Err(Error::MissingField { .. })));
        assert!(session.calls().is_empty());
        assert!(!temp.path().join("generated/networks").exists());
    }

    #[test]
    fn test_start_failure_is_isolated() {
        let (session, renderer, _temp) = setup();
        session.fail_start("net-a");
        let specs = networks(
            "networks:\n  - name: net-a\n    bridge: virbr10\n  - name: net-b\n    bridge: virbr11\n",
        );

        let reconciler = DefinitionReconciler::networks();
        let report = reconciler.ensure_present(&ctx(&session, &renderer), &specs).unwrap();

        let failed = report.outcome("net-a").unwrap();
        assert_eq!(failed.actions, vec![Action::Defined, Action::AutostartEnabled]);
        assert_eq!(failed.failure.as_ref().unwrap().operation, "start");
        assert_eq!(session.status(ResourceKind::Network, "net-b"), Some((true, true)));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, Error::Reconcile { ref failures, .. } if failures.len() == 1));
    }

    #[test]
    fn test_partial_create_completes_next_run() {
        let (session, renderer, _temp) = setup();
        session.fail_start("net-a");
        let reconciler = DefinitionReconciler::networks();
        let specs = net_a();

        let report = reconciler.ensure_present(&ctx(&session, &renderer), &specs).unwrap();
        assert!(report.has_failures());
        assert_eq!(session.status(ResourceKind::Network, "net-a"), Some((false, true)));

        // Operator fixed the cause; the retry only starts the resource
        let session2 = MemorySession::new();
        session2.insert(ResourceKind::Network, "net-a", "<network><name>net-a</name></network>", false, true);
        reconciler.ensure_present(&ctx(&session2, &renderer), &specs).unwrap();
        assert_eq!(session2.calls(), vec![Call::Start("net-a".into())]);
    }

    #[test]
    fn test_destroy_active_resource() {
        let (session, renderer, temp) = setup();
        let reconciler = DefinitionReconciler::networks();
        let specs = net_a();

        reconciler.ensure_present(&ctx(&session, &renderer), &specs).unwrap();
        session.clear_calls();

        let report = reconciler.ensure_absent(&ctx(&session, &renderer), &specs).unwrap();

        assert_eq!(
            session.calls(),
            vec![Call::Stop("net-a".into()), Call::Undefine("net-a".into())]
        );
        assert_eq!(
            report.outcome("net-a").unwrap().actions,
            vec![Action::Stopped, Action::Undefined, Action::ArtifactRemoved]
        );
        assert!(report.directory_removed);
        assert!(!temp.path().join("generated/networks").exists());
        assert!(session.lookup(ResourceKind::Network, "net-a").unwrap().is_none());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (session, renderer, temp) = setup();
        let reconciler = DefinitionReconciler::networks();
        let specs = net_a();

        // Nothing exists and no output directory either
        let report = reconciler.ensure_absent(&ctx(&session, &renderer), &specs).unwrap();
        assert!(session.calls().is_empty());
        assert!(report.outcome("net-a").unwrap().is_noop());

        // An empty output directory is removed
        std::fs::create_dir_all(temp.path().join("generated/networks")).unwrap();
        reconciler.ensure_absent(&ctx(&session, &renderer), &specs).unwrap();
        assert!(session.calls().is_empty());
        assert!(!temp.path().join("generated/networks").exists());
    }

    #[test]
    fn test_destroy_leftover_file() {
        let (session, renderer, temp) = setup();
        let dir = temp.path().join("generated/networks");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("notes.txt"), "keep me").unwrap();

        let reconciler = DefinitionReconciler::networks();
        let result = reconciler.ensure_absent(&ctx(&session, &renderer), &net_a());
        assert!(matches!(result, Err(Error::DirectoryNotEmpty(_))));
        assert!(dir.join("notes.txt").exists());
    }

    #[test]
    fn test_drift_redefines_when_enabled() {
        let (session, renderer, _temp) = setup();
        let reconciler = DefinitionReconciler::networks();
        reconciler.ensure_present(&ctx(&session, &renderer), &net_a()).unwrap();
        session.clear_calls();

        let changed = networks("networks:\n  - name: net-a\n    bridge: virbr20\n");

        // Default policy leaves the live definition alone
        reconciler.ensure_present(&ctx(&session, &renderer), &changed).unwrap();
        assert!(session.calls().is_empty());

        let drift_ctx = ReconcileContext {
            session: &session,
            renderer: &renderer,
            drift: DriftPolicy::Redefine,
        };
        let uuid = session.uuid(ResourceKind::Network, "net-a").unwrap();
        let report = reconciler.ensure_present(&drift_ctx, &changed).unwrap();

        // The artifact stays the plain rendering; the define carries the live identity
        let artifact = renderer.read_artifact("networks", "net-a").unwrap();
        assert!(artifact.contains("virbr20"));
        assert!(!artifact.contains("<uuid>"));
        assert_eq!(
            session.calls(),
            vec![
                Call::Define(ResourceKind::Network, with_uuid(&artifact, &uuid.to_string())),
                Call::Stop("net-a".into()),
                Call::Start("net-a".into()),
            ]
        );
        assert_eq!(session.uuid(ResourceKind::Network, "net-a"), Some(uuid));
        assert_eq!(
            report.outcome("net-a").unwrap().actions,
            vec![Action::Redefined, Action::Stopped, Action::Started]
        );

        // Converged: nothing more to do
        session.clear_calls();
        reconciler.ensure_present(&drift_ctx, &changed).unwrap();
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_drift_redefine_fails_without_live_uuid() {
        let (_, renderer, _temp) = setup();
        renderer
            .write_artifact("networks", "net-a", "<network><name>net-a</name></network>")
            .unwrap();

        let mut mock = MockSession::new();
        mock.expect_list_active()
            .returning(|_| Ok(BTreeSet::from(["net-a".to_string()])));
        mock.expect_list_defined().returning(|_| Ok(BTreeSet::new()));
        mock.expect_lookup()
            .returning(|kind, name| Ok(Some(ResourceHandle::new(kind, name))));
        mock.expect_is_active().returning(|_| Ok(true));
        mock.expect_definition()
            .returning(|_| Ok("<network><name>net-a</name></network>".into()));
        mock.expect_define().never();

        let drift_ctx = ReconcileContext {
            session: &mock,
            renderer: &renderer,
            drift: DriftPolicy::Redefine,
        };
        let report = DefinitionReconciler::networks()
            .ensure_present(&drift_ctx, &net_a())
            .unwrap();
        let failure = report.outcome("net-a").unwrap().failure.clone().unwrap();
        assert_eq!(failure.operation, "read definition");
    }

    #[test]
    fn test_drift_without_baseline() {
        let (session, renderer, _temp) = setup();
        session.insert(ResourceKind::Network, "net-a", "<network><name>net-a</name></network>", true, true);

        let reconciler = DefinitionReconciler::networks();
        let drift_ctx = ReconcileContext {
            session: &session,
            renderer: &renderer,
            drift: DriftPolicy::Redefine,
        };
        reconciler.ensure_present(&drift_ctx, &net_a()).unwrap();

        assert!(session.calls().is_empty());
        assert!(renderer.existing_artifact("networks", "net-a").unwrap().is_some());
    }

    #[test]
    fn test_observe_states() {
        let (session, renderer, _temp) = setup();
        session.insert(ResourceKind::Network, "net-b", "<network><name>net-b</name></network>", false, true);
        session.insert(ResourceKind::Network, "net-c", "<network><name>net-c</name></network>", true, false);
        let specs = networks("networks:\n  - name: net-a\n  - name: net-b\n  - name: net-c\n");

        let reconciler = DefinitionReconciler::networks();
        let status = reconciler.observe(&ctx(&session, &renderer), &specs).unwrap();

        let states: Vec<_> = status.resources.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                ResourceState::Absent,
                ResourceState::Defined { autostart: true },
                ResourceState::Active { autostart: false },
            ]
        );
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_define_returning_other_resource_is_fatal() {
        let (_, renderer, _temp) = setup();
        let mut mock = MockSession::new();
        mock.expect_list_active().returning(|_| Ok(BTreeSet::new()));
        mock.expect_list_defined().returning(|_| Ok(BTreeSet::new()));
        mock.expect_define()
            .times(1)
            .returning(|kind, _| Ok(ResourceHandle::new(kind, "net-z")));
        mock.expect_set_autostart().never();
        mock.expect_start().never();

        let reconciler = DefinitionReconciler::networks();
        let result = reconciler.ensure_present(&ctx(&mock, &renderer), &net_a());
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn test_vanished_between_list_and_lookup() {
        let (_, renderer, _temp) = setup();
        let mut mock = MockSession::new();
        mock.expect_list_active()
            .returning(|_| Ok(BTreeSet::from(["net-a".to_string()])));
        mock.expect_list_defined().returning(|_| Ok(BTreeSet::new()));
        mock.expect_lookup().returning(|_, _| Ok(None));
        mock.expect_start().never();
        mock.expect_define().never();

        let reconciler = DefinitionReconciler::networks();
        let report = reconciler.ensure_present(&ctx(&mock, &renderer), &net_a()).unwrap();
        let failure = report.outcome("net-a").unwrap().failure.clone().unwrap();
        assert_eq!(failure.operation, "lookup");
    }

    #[test]
    fn test_stale_handle_on_stop_is_isolated() {
        let (_, renderer, _temp) = setup();
        let mut mock = MockSession::new();
        mock.expect_list_active()
            .returning(|_| Ok(BTreeSet::from(["net-a".to_string(), "net-b".to_string()])));
        mock.expect_list_defined().returning(|_| Ok(BTreeSet::new()));
        mock.expect_lookup()
            .returning(|kind, name| Ok(Some(ResourceHandle::new(kind, name))));
        mock.expect_is_active().returning(|_| Ok(true));
        mock.expect_stop().times(2).returning(|handle| {
            if handle.name == "net-a" {
                Err(handle.not_found())
            } else {
                Ok(())
            }
        });
        mock.expect_undefine().times(1).returning(|_| Ok(()));

        let specs = networks("networks:\n  - name: net-a\n  - name: net-b\n");
        let reconciler = DefinitionReconciler::networks();
        let report = reconciler.ensure_absent(&ctx(&mock, &renderer), &specs).unwrap();

        assert!(report.outcome("net-a").unwrap().failure.is_some());
        assert_eq!(
            report.outcome("net-b").unwrap().actions,
            vec![Action::Stopped, Action::Undefined]
        );
        // No artifacts were ever written, so the directory is simply absent
        assert!(report.directory_removed);
    }

    #[test]
    fn test_failed_teardown_keeps_output_directory() {
        let (_, renderer, temp) = setup();
        renderer.render("networks", NETWORK_TEMPLATE, &net_a()[0]).unwrap();

        let mut mock = MockSession::new();
        mock.expect_list_active()
            .returning(|_| Ok(BTreeSet::from(["net-a".to_string()])));
        mock.expect_list_defined().returning(|_| Ok(BTreeSet::new()));
        mock.expect_lookup()
            .returning(|kind, name| Ok(Some(ResourceHandle::new(kind, name))));
        mock.expect_is_active().returning(|_| Ok(true));
        mock.expect_stop().times(1).returning(|handle| {
            Err(Error::Stop {
                kind: handle.kind.to_string(),
                name: handle.name.clone(),
                reason: "device busy".into(),
            })
        });
        mock.expect_undefine().never();

        let report = DefinitionReconciler::networks()
            .ensure_absent(&ctx(&mock, &renderer), &net_a())
            .unwrap();

        assert_eq!(report.outcome("net-a").unwrap().failure.as_ref().unwrap().operation, "stop");
        assert!(!report.directory_removed);
        assert!(temp.path().join("generated/networks/net-a.xml").exists());
        assert!(matches!(report.into_result(), Err(Error::Reconcile { .. })));
    }

    #[test]
    fn test_render_only() {
        let (session, renderer, temp) = setup();
        let specs = networks(
            "networks:\n  - name: net-a\n    bridge: virbr10\n  - name: net-b\n    bridge: virbr11\n",
        );

        let paths = DefinitionReconciler::networks().render(&renderer, &specs).unwrap();
        assert_eq!(
            paths,
            vec![
                temp.path().join("generated/networks/net-a.xml"),
                temp.path().join("generated/networks/net-b.xml"),
            ]
        );
        assert!(session.calls().is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ResourceState::Absent.to_string(), "absent");
        assert_eq!(
            ResourceState::Active { autostart: true }.to_string(),
            "active (autostart: true)"
        );
    }
}
