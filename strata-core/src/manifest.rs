//! Synthesis manifest parsing
//!
//! The synthesis toolkit writes a `manifest.json` into the output directory
//! describing every artifact it produced. Only stack artifacts matter here;
//! asset-publishing and tree artifacts are dropped, along with any
//! dependency edges pointing at them.

use crate::error::{Result, StrataError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STACK_ARTIFACT_TYPE: &str = "aws:cloudformation:stack";

const UNKNOWN_REGION: &str = "unknown-region";

/// A deployable stack as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescriptor {
    /// Artifact id, also used as the dependency key.
    pub id: String,
    /// Deployed stack name. Usually equal to `id` unless the manifest
    /// overrides it.
    pub name: String,
    pub region: String,
    /// Ids of stack artifacts this stack depends on.
    pub dependencies: Vec<String>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    artifacts: BTreeMap<String, RawArtifact>,
}

#[derive(Deserialize)]
struct RawArtifact {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    properties: RawProperties,
}

#[derive(Deserialize, Default)]
struct RawProperties {
    #[serde(rename = "stackName")]
    stack_name: Option<String>,
}

pub struct ManifestReader;

impl ManifestReader {
    /// Read and parse `manifest.json` from the synthesis output directory.
    pub fn read(out_dir: &Path, default_region: &str) -> Result<Vec<StackDescriptor>> {
        let path = out_dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| StrataError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&content, default_region).map_err(|e| match e {
            StrataError::Manifest { reason, .. } => StrataError::Manifest { path, reason },
            other => other,
        })
    }

    pub fn parse(content: &str, default_region: &str) -> Result<Vec<StackDescriptor>> {
        let raw: RawManifest = serde_json::from_str(content).map_err(|e| StrataError::Manifest {
            path: MANIFEST_FILE.into(),
            reason: e.to_string(),
        })?;

        let stack_ids: Vec<String> = raw
            .artifacts
            .iter()
            .filter(|(_, artifact)| artifact.kind == STACK_ARTIFACT_TYPE)
            .map(|(id, _)| id.clone())
            .collect();

        Ok(raw
            .artifacts
            .into_iter()
            .filter(|(_, artifact)| artifact.kind == STACK_ARTIFACT_TYPE)
            .map(|(id, artifact)| StackDescriptor {
                name: artifact.properties.stack_name.unwrap_or_else(|| id.clone()),
                region: parse_region(&artifact.environment, default_region),
                dependencies: artifact
                    .dependencies
                    .into_iter()
                    .filter(|dep| stack_ids.contains(dep))
                    .collect(),
                id,
            })
            .collect())
    }

    /// Narrow to a single stack for single-stack mode. The surviving stack
    /// keeps no dependency edges; whatever it needed is assumed deployed.
    pub fn narrow(stacks: Vec<StackDescriptor>, stack_id: &str) -> Result<Vec<StackDescriptor>> {
        let mut stack = stacks
            .into_iter()
            .find(|s| s.id == stack_id || s.name == stack_id)
            .ok_or_else(|| StrataError::UnknownStack {
                stack: stack_id.to_string(),
            })?;
        stack.dependencies.clear();
        Ok(vec![stack])
    }
}

/// Environments look like `aws://123456789012/us-west-2`. A missing or
/// unresolved region falls back to the configured default.
fn parse_region(environment: &str, default_region: &str) -> String {
    match environment.rsplit('/').next() {
        Some(region) if !region.is_empty() && region != UNKNOWN_REGION => region.to_string(),
        _ => default_region.to_string(),
    }
}
