//! Template diff optimizer
//!
//! Skips a full deployment when the locally synthesized template is
//! semantically identical to what is already deployed. Comparison is
//! conservative: any parse failure, any provider error, or any dynamic
//! parameter in the deployed template forces the full deployment path.

use crate::error::Result;
use crate::provider::{StackDescription, StackProvider};
use crate::StrataError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Parameter types resolved by the provider at deploy time. Their values
/// can change without the template text changing, so textual equality
/// proves nothing.
pub const DYNAMIC_PARAMETER_TYPE_PREFIX: &str = "AWS::SSM::Parameter";

pub fn local_template_path(out_dir: &Path, stack_id: &str) -> PathBuf {
    out_dir.join(format!("{stack_id}.template.json"))
}

pub fn read_local_template(out_dir: &Path, stack_id: &str) -> Result<String> {
    let path = local_template_path(out_dir, stack_id);
    std::fs::read_to_string(&path).map_err(|source| StrataError::Io { path, source })
}

/// Parse a template body (JSON or YAML) and re-serialize it into a
/// canonical JSON form with sorted keys, so formatting and key order do
/// not register as differences. Returns `None` when the body cannot be
/// parsed.
pub fn canonicalize(body: &str) -> Option<String> {
    serde_json::to_string(&parse_value(body)?).ok()
}

pub(crate) fn parse_value(body: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(_) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(body).ok()?;
            serde_json::to_value(yaml).ok()
        }
    }
}

/// Whether any declared template parameter is dynamically resolved.
pub fn has_dynamic_parameters(body: &str) -> bool {
    let Some(value) = parse_value(body) else {
        return false;
    };
    value
        .get("Parameters")
        .and_then(|p| p.as_object())
        .map(|params| {
            params.values().any(|param| {
                param
                    .get("Type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.starts_with(DYNAMIC_PARAMETER_TYPE_PREFIX))
            })
        })
        .unwrap_or(false)
}

/// Decide whether a deployment can be skipped entirely. Only stacks
/// resting in a healthy complete state qualify; everything else, and every
/// error along the way, answers "changed".
pub async fn is_unchanged(
    provider: &dyn StackProvider,
    region: &str,
    described: &StackDescription,
    local_body: &str,
) -> bool {
    if !described.status.is_deploy_complete() {
        return false;
    }
    match compare(provider, region, &described.name, local_body).await {
        Ok(unchanged) => unchanged,
        Err(err) => {
            debug!(stack = %described.name, error = %err, "Template comparison failed, deploying");
            false
        }
    }
}

async fn compare(
    provider: &dyn StackProvider,
    region: &str,
    name: &str,
    local_body: &str,
) -> Result<bool> {
    let deployed = provider.get_template(region, name).await?;
    if has_dynamic_parameters(&deployed) {
        return Ok(false);
    }
    match (canonicalize(&deployed), canonicalize(local_body)) {
        (Some(a), Some(b)) => Ok(a == b),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_ignores_key_order_and_whitespace() {
        let a = r#"{"Resources": {"B": {"Type": "T"}, "A": {"Type": "T"}}}"#;
        let b = "{ \"Resources\": {\n  \"A\": {\"Type\": \"T\"},\n  \"B\": {\"Type\": \"T\"}\n} }";
        assert_eq!(canonicalize(a), canonicalize(b));
    }

    #[test]
    fn canonical_form_bridges_yaml_and_json() {
        let yaml = "Resources:\n  Table:\n    Type: AWS::DynamoDB::Table\n";
        let json = r#"{"Resources":{"Table":{"Type":"AWS::DynamoDB::Table"}}}"#;
        assert_eq!(canonicalize(yaml), canonicalize(json));
    }

    #[test]
    fn unparseable_body_yields_none() {
        assert_eq!(canonicalize("{ not valid: ["), None);
    }

    #[test]
    fn detects_dynamic_parameters() {
        let with = r#"{
            "Parameters": {
                "BootstrapVersion": {
                    "Type": "AWS::SSM::Parameter::Value<String>",
                    "Default": "/bootstrap/version"
                }
            }
        }"#;
        let without = r#"{
            "Parameters": { "Stage": { "Type": "String" } },
            "Resources": {}
        }"#;
        assert!(has_dynamic_parameters(with));
        assert!(!has_dynamic_parameters(without));
        assert!(!has_dynamic_parameters("{}"));
    }
}
