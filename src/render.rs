//! Definition rendering from Jinja templates
//!
//! Templates are resolved relative to a source directory and rendered with
//! strict undefined semantics: a template that references a field the
//! resource record does not carry fails instead of producing an incomplete
//! definition. Rendered text lands in `<output>/<kind>/<name>.xml`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use crate::desired::ResourceSpec;
use crate::{Error, Result};

/// Extension of rendered definition artifacts
pub const DEFINITION_EXT: &str = "xml";

pub struct Renderer {
    env: Environment<'static>,
    output_dir: PathBuf,
}

impl Renderer {
    pub fn new(template_dir: impl AsRef<Path>, output_dir: impl Into<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_loader(minijinja::path_loader(template_dir.as_ref().to_path_buf()));
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        // Values go into the definition verbatim, whatever the template suffix
        env.set_auto_escape_callback(|_| AutoEscape::None);

        Self {
            env,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn kind_dir(&self, kind: &str) -> PathBuf {
        self.output_dir.join(kind)
    }

    pub fn artifact_path(&self, kind: &str, name: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{name}.{DEFINITION_EXT}"))
    }

    /// Render a spec in memory without touching the output tree
    pub fn render_text(&self, template: &str, spec: &ResourceSpec) -> Result<String> {
        let tmpl = self
            .env
            .get_template(template)
            .map_err(|e| Error::from_template(&e, template, spec.name()))?;
        tmpl.render(spec.fields())
            .map_err(|e| Error::from_template(&e, template, spec.name()))
    }

    /// Render a spec and write the artifact, replacing any previous one
    pub fn render(&self, kind: &str, template: &str, spec: &ResourceSpec) -> Result<PathBuf> {
        let text = self.render_text(template, spec)?;
        let path = self.write_artifact(kind, spec.name(), &text)?;
        tracing::debug!(kind = %kind, resource = %spec.name(), path = %path.display(), "Generated definition");
        Ok(path)
    }

    pub fn write_artifact(&self, kind: &str, name: &str, text: &str) -> Result<PathBuf> {
        let path = self.artifact_path(kind, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, text)?;
        Ok(path)
    }

    /// Read a previously written artifact back
    pub fn read_artifact(&self, kind: &str, name: &str) -> Result<String> {
        let path = self.artifact_path(kind, name);
        std::fs::read_to_string(&path).map_err(|source| Error::MissingArtifact { path, source })
    }

    /// Last written artifact, `None` when there is none
    pub fn existing_artifact(&self, kind: &str, name: &str) -> Result<Option<String>> {
        match self.read_artifact(kind, name) {
            Ok(text) => Ok(Some(text)),
            Err(Error::MissingArtifact { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an artifact. Returns whether a file was removed.
    pub fn remove_artifact(&self, kind: &str, name: &str) -> Result<bool> {
        match std::fs::remove_file(self.artifact_path(kind, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a kind's output directory, which must be empty.
    pub fn remove_kind_dir(&self, kind: &str) -> Result<()> {
        let dir = self.kind_dir(kind);
        match std::fs::remove_dir(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => Err(Error::DirectoryNotEmpty(dir)),
            Err(e) => Err(e.into()),
        }
    }
}
