//! Orchestrator driving reconciliation for every declared resource kind

use std::collections::HashMap;
use std::path::PathBuf;
use serde::Serialize;
use crate::config::RunConfig;
use crate::desired::{DesiredState, ResourceSpec};
use crate::reconcile::{DefinitionReconciler, KindReport, KindStatus, Reconcile, ReconcileContext};
use crate::render::Renderer;
use crate::session::{Connector, Session};
use crate::{Error, Result};

/// Reconcilers keyed by the kind name used in the desired-state document
#[derive(Default)]
pub struct Registry {
    reconcilers: HashMap<String, Box<dyn Reconcile>>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind this crate knows how to reconcile
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(DefinitionReconciler::networks()));
        registry
    }

    /// Register a reconciler, returning the one it replaces
    pub fn register(&mut self, reconciler: Box<dyn Reconcile>) -> Option<Box<dyn Reconcile>> {
        self.reconcilers
            .insert(reconciler.kind_name().to_string(), reconciler)
    }

    pub fn get(&self, kind: &str) -> Option<&dyn Reconcile> {
        self.reconcilers.get(kind).map(|r| r.as_ref())
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.reconcilers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

/// Outcome of a create or destroy run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub kinds: Vec<KindReport>,
    /// Declared kinds nothing is registered for
    pub skipped: Vec<String>,
}

/// Owns the hypervisor session for the duration of a run
pub struct Orchestrator {
    session: Option<Box<dyn Session>>,
    renderer: Renderer,
    registry: Registry,
    config: RunConfig,
    uri: &'static str,
}

impl Orchestrator {
    /// Resolve the hypervisor URI and open a session through `connector`
    pub fn connect(config: RunConfig, connector: &dyn Connector) -> Result<Self> {
        config.validate()?;
        let uri = config.uri()?;
        let session = connector.open(uri)?;
        tracing::debug!(uri = %uri, "Session opened");

        Ok(Self {
            session: Some(session),
            renderer: Renderer::new(&config.template_dir, config.output_dir.clone()),
            registry: Registry::with_defaults(),
            config,
            uri,
        })
    }

    /// Connect, run `f`, and close the session whatever `f` returns
    pub fn scoped<T>(
        config: RunConfig,
        connector: &dyn Connector,
        f: impl FnOnce(&Orchestrator) -> Result<T>,
    ) -> Result<T> {
        let mut orch = Self::connect(config, connector)?;
        let result = f(&orch);
        orch.close();
        result
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn uri(&self) -> &str {
        self.uri
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn context(&self) -> Result<ReconcileContext<'_>> {
        let session = self.session.as_deref().ok_or_else(|| Error::Connection {
            uri: self.uri.to_string(),
            reason: "session already closed".into(),
        })?;
        Ok(ReconcileContext {
            session,
            renderer: &self.renderer,
            drift: self.config.drift,
        })
    }

    fn run<F>(&self, desired: &DesiredState, verb: &str, mut apply: F) -> Result<RunReport>
    where
        F: FnMut(&dyn Reconcile, &ReconcileContext<'_>, &[ResourceSpec]) -> Result<KindReport>,
    {
        let ctx = self.context()?;
        let mut report = RunReport::default();

        for (kind, specs) in desired.kinds() {
            let Some(reconciler) = self.registry.get(kind) else {
                tracing::warn!(kind = %kind, "No reconciler registered, skipping");
                report.skipped.push(kind.to_string());
                continue;
            };

            tracing::info!(kind = %kind, count = specs.len(), "{verb} {kind}");
            let kind_report = apply(reconciler, &ctx, specs)?;
            report.kinds.push(kind_report.into_result()?);
        }
        Ok(report)
    }

    /// Make every declared resource exist, be active and autostart
    pub fn create_infra(&self, desired: &DesiredState) -> Result<RunReport> {
        self.run(desired, "Creating", |r, ctx, specs| r.ensure_present(ctx, specs))
    }

    /// Remove every declared resource and its generated definition
    pub fn destroy_infra(&self, desired: &DesiredState) -> Result<RunReport> {
        self.run(desired, "Destroying", |r, ctx, specs| r.ensure_absent(ctx, specs))
    }

    /// Observed state of every declared resource
    pub fn status(&self, desired: &DesiredState) -> Result<Vec<KindStatus>> {
        let ctx = self.context()?;
        desired
            .kinds()
            .filter_map(|(kind, specs)| self.registry.get(kind).map(|r| r.observe(&ctx, specs)))
            .collect()
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            tracing::info!(uri = %self.uri, "Connection has been closed");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render definitions for every registered kind without a hypervisor
pub fn render_all(renderer: &Renderer, registry: &Registry, desired: &DesiredState) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for (kind, specs) in desired.kinds() {
        match registry.get(kind) {
            Some(reconciler) => paths.extend(reconciler.render(renderer, specs)?),
            None => tracing::warn!(kind = %kind, "No reconciler registered, skipping"),
        }
    }
    Ok(paths)
}
