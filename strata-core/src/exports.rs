//! Export preservation guard
//!
//! Deleting an export that another stack still imports makes the provider
//! reject the whole update. Before a deployment is handed to the toolkit,
//! this guard compares the exports live on the stack against the ones the
//! new template declares, and re-injects any still-imported export into
//! the local template so the deployment cannot strand an importer.

use crate::error::Result;
use crate::manifest::StackDescriptor;
use crate::provider::{StackDescription, StackProvider};
use crate::template;
use crate::StrataError;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

/// Export names declared in a template's `Outputs` section. Exports whose
/// name is an intrinsic (a non-string value) cannot be compared textually
/// and are ignored.
pub fn template_export_names(body: &str) -> BTreeSet<String> {
    let Some(value) = template::parse_value(body) else {
        return BTreeSet::new();
    };
    value
        .get("Outputs")
        .and_then(|o| o.as_object())
        .map(|outputs| {
            outputs
                .values()
                .filter_map(|output| output.pointer("/Export/Name"))
                .filter_map(|name| name.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Run the guard for one stack. Best effort: a failure here must never
/// block the deployment, so errors are logged and swallowed.
pub async fn preserve_exports(
    provider: &dyn StackProvider,
    out_dir: &Path,
    stack: &StackDescriptor,
    described: &StackDescription,
) {
    if let Err(err) = run(provider, out_dir, stack, described).await {
        warn!(stack = %stack.name, error = %err, "Export preservation check failed, continuing");
    }
}

async fn run(
    provider: &dyn StackProvider,
    out_dir: &Path,
    stack: &StackDescriptor,
    described: &StackDescription,
) -> Result<()> {
    let live_exports = described.exports_map();
    if live_exports.is_empty() {
        return Ok(());
    }

    let body = template::read_local_template(out_dir, &stack.id)?;
    let declared = template_export_names(&body);
    let mut doc: serde_json::Value = serde_json::from_str(&body)?;
    if !doc.is_object() || doc.get("Outputs").is_some_and(|outputs| !outputs.is_object()) {
        warn!(stack = %stack.name, "Local template has a malformed Outputs section, leaving it alone");
        return Ok(());
    }
    let mut retained = false;

    for (export_name, value) in live_exports {
        if declared.contains(&export_name) {
            continue;
        }
        let importers = provider.list_imports(&stack.region, &export_name).await?;
        let Some(importer) = importers.first() else {
            continue;
        };
        info!(
            stack = %stack.name,
            export = %export_name,
            importer = %importer,
            "Retaining dropped export still imported by another stack"
        );
        doc["Outputs"][retained_output_key(&export_name)] = json!({
            "Value": value,
            "Export": { "Name": export_name },
            "Description": format!("Retained export, still imported by {importer}"),
        });
        retained = true;
    }

    if retained {
        let path = template::local_template_path(out_dir, &stack.id);
        let content = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&path, content).map_err(|source| StrataError::Io { path, source })?;
    }
    Ok(())
}

/// Output logical ids must be alphanumeric; export names rarely are.
fn retained_output_key(export_name: &str) -> String {
    let sanitized: String = export_name.chars().filter(|c| c.is_alphanumeric()).collect();
    format!("Retained{sanitized}")
}
