//! Desired-state document loaded from YAML

use std::collections::HashSet;
use std::path::Path;
use serde_yaml::{Mapping, Value};
use crate::{Error, Result};

/// One declared resource: its name plus the full record handed to templates
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    name: String,
    fields: Mapping,
}

impl ResourceSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every key of the record, `name` included
    pub fn fields(&self) -> &Mapping {
        &self.fields
    }

    fn from_value(kind: &str, index: usize, value: Value) -> Result<Self> {
        let Value::Mapping(fields) = value else {
            return Err(Error::DesiredState(format!(
                "{kind}[{index}] must be a mapping"
            )));
        };

        let name = match fields.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => {
                validate_name(kind, index, name)?;
                name.clone()
            }
            Some(Value::String(_)) | None => {
                return Err(Error::DesiredState(format!(
                    "{kind}[{index}] has no name"
                )))
            }
            Some(_) => {
                return Err(Error::DesiredState(format!(
                    "{kind}[{index}].name must be a string"
                )))
            }
        };

        Ok(Self { name, fields })
    }
}

/// Names double as artifact file names and must match what the hypervisor
/// reports back.
fn validate_name(kind: &str, index: usize, name: &str) -> Result<()> {
    if name.trim() != name {
        return Err(Error::DesiredState(format!(
            "{kind}[{index}].name {name:?} has surrounding whitespace"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::DesiredState(format!(
            "{kind}[{index}].name {name:?} is not a valid file name"
        )));
    }
    Ok(())
}

/// Declared resources grouped by kind, in document order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    kinds: Vec<(String, Vec<ResourceSpec>)>,
}

impl DesiredState {
    /// Load and validate a values file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::ValuesNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(content)?;
        let mapping = match root {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(Error::DesiredState(
                    "top level must map resource kinds to lists".into(),
                ))
            }
        };

        let mut kinds = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let kind = match key {
                Value::String(kind) => kind,
                other => {
                    return Err(Error::DesiredState(format!(
                        "resource kind must be a string, got {other:?}"
                    )))
                }
            };
            let specs = match value {
                Value::Null => Vec::new(),
                Value::Sequence(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| ResourceSpec::from_value(&kind, i, item))
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    return Err(Error::DesiredState(format!(
                        "{kind} must be a list of resources"
                    )))
                }
            };

            let mut seen = HashSet::new();
            if let Some(dup) = specs.iter().find(|s| !seen.insert(s.name())) {
                return Err(Error::DesiredState(format!(
                    "duplicate name {} in {kind}",
                    dup.name()
                )));
            }

            kinds.push((kind, specs));
        }

        Ok(Self { kinds })
    }

    /// Kinds and their specs, in document order
    pub fn kinds(&self) -> impl Iterator<Item = (&str, &[ResourceSpec])> {
        self.kinds.iter().map(|(kind, specs)| (kind.as_str(), specs.as_slice()))
    }

    pub fn get(&self, kind: &str) -> Option<&[ResourceSpec]> {
        self.kinds
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, specs)| specs.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.iter().all(|(_, specs)| specs.is_empty())
    }
}
