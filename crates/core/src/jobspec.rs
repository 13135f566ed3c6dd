//! Declarative job descriptions (Tekton `TaskRun` documents).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only job kind the daemon submits.
pub const TASK_RUN_KIND: &str = "TaskRun";

/// Errors loading or validating a job description.
#[derive(Debug, Error)]
pub enum JobSpecError {
    /// File could not be read.
    #[error("read {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Not valid YAML or wrong shape.
    #[error("parse job description: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// `apiVersion` empty.
    #[error("job description is missing apiVersion")]
    MissingApiVersion,
    /// `kind` is not `TaskRun`.
    #[error("unsupported kind {0:?}, expected {TASK_RUN_KIND}")]
    UnsupportedKind(String),
    /// Neither `metadata.name` nor `metadata.generateName`.
    #[error("metadata.name or metadata.generateName is required")]
    MissingName,
    /// `spec` lacks a task reference.
    #[error("spec must contain taskRef or taskSpec")]
    MissingTask,
}

/// A job description as submitted to the execution engine.
///
/// Unknown fields are preserved so the document round-trips to the engine
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// API group/version, e.g. `tekton.dev/v1`.
    #[serde(default)]
    pub api_version: String,
    /// Resource kind.
    #[serde(default)]
    pub kind: String,
    /// Object metadata.
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Kind-specific body.
    #[serde(default)]
    pub spec: serde_yaml::Value,
    /// Everything else (e.g. `status` in exported manifests).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Subset of object metadata the daemon cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    /// Fixed name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name prefix; the engine appends a random suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    /// Target namespace; the daemon's default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels, annotations and anything else.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl JobSpec {
    /// Parses a YAML document without validating it.
    pub fn from_yaml_str(s: &str) -> Result<Self, JobSpecError> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Reads, parses and validates a job description file.
    pub fn load(path: &Path) -> Result<Self, JobSpecError> {
        let text = std::fs::read_to_string(path).map_err(|source| JobSpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let spec = Self::from_yaml_str(&text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks the description is something the engine can run.
    pub fn validate(&self) -> Result<(), JobSpecError> {
        if self.api_version.trim().is_empty() {
            return Err(JobSpecError::MissingApiVersion);
        }
        if self.kind != TASK_RUN_KIND {
            return Err(JobSpecError::UnsupportedKind(self.kind.clone()));
        }
        if self.display_name().is_none() {
            return Err(JobSpecError::MissingName);
        }
        let has_task = self
            .spec
            .as_mapping()
            .map(|m| m.contains_key("taskRef") || m.contains_key("taskSpec"))
            .unwrap_or(false);
        if !has_task {
            return Err(JobSpecError::MissingTask);
        }
        Ok(())
    }

    /// `metadata.name`, else `metadata.generateName`, ignoring blanks.
    pub fn display_name(&self) -> Option<&str> {
        [&self.metadata.name, &self.metadata.generate_name]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .find(|s| !s.trim().is_empty())
    }

    /// Serializes back to YAML for submission.
    pub fn to_yaml(&self) -> Result<String, JobSpecError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
apiVersion: tekton.dev/v1
kind: TaskRun
metadata:
  generateName: verify-build-
  labels:
    app: buildenv
spec:
  taskRef:
    name: buildah
"#;

    #[test]
    fn valid_document_passes() {
        let spec = JobSpec::from_yaml_str(VALID).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.display_name(), Some("verify-build-"));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let spec = JobSpec::from_yaml_str(VALID).unwrap();
        let again = JobSpec::from_yaml_str(&spec.to_yaml().unwrap()).unwrap();
        assert_eq!(spec, again);
        assert!(again.metadata.extra.contains_key("labels"));
    }

    #[test]
    fn blank_name_is_rejected() {
        let doc = VALID.replace("generateName: verify-build-", "name: \"  \"");
        let err = JobSpec::from_yaml_str(&doc).unwrap().validate().unwrap_err();
        assert!(matches!(err, JobSpecError::MissingName));
    }
}
