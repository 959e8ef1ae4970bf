//! [`StackProvider`] backed by the `aws` CLI
//!
//! Keeps the engine free of a vendored SDK: every control-plane call shells
//! out to `aws cloudformation` with `--output json` and parses the result.
//! Error classification happens here, by matching the error text the CLI
//! prints, so nothing downstream ever sees provider message strings.

use super::{
    ProviderError, ProviderResult, StackDescription, StackEvent, StackOutput, StackProvider,
    StackStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

pub struct AwsCliProvider {
    bin: String,
}

impl AwsCliProvider {
    pub fn new() -> Self {
        Self { bin: "aws".to_string() }
    }

    pub fn with_bin(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn invoke(&self, region: &str, args: &[&str]) -> ProviderResult<String> {
        trace!(region, ?args, "Invoking control-plane CLI");
        let output = Command::new(&self.bin)
            .arg("cloudformation")
            .args(args)
            .args(["--region", region, "--output", "json"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Network(format!("failed to run {}: {e}", self.bin)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl Default for AwsCliProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Map CLI error text onto the provider taxonomy.
fn classify(stderr: &str) -> ProviderError {
    let text = stderr.trim();
    if text.contains("does not exist") {
        let name = text
            .split(" does not exist")
            .next()
            .and_then(|prefix| prefix.rsplit(' ').next())
            .unwrap_or_default()
            .trim_matches(|c| matches!(c, '[' | ']' | '\'' | '"'));
        return ProviderError::StackNotFound(name.to_string());
    }
    if text.contains("Throttling") || text.contains("Rate exceeded") {
        return ProviderError::Throttled;
    }
    if text.contains("TooManyRequests") || text.contains("Too Many Requests") {
        return ProviderError::TooManyRequests;
    }
    if text.contains("OperationAborted") {
        return ProviderError::OperationAborted;
    }
    if text.contains("timed out") || text.contains("Read timeout") {
        return ProviderError::Timeout;
    }
    if text.contains("Could not connect") || text.contains("EndpointConnectionError") {
        return ProviderError::Network(text.to_string());
    }
    if text.contains("ValidationError") {
        return ProviderError::Validation {
            code: "ValidationError".to_string(),
            message: text.to_string(),
        };
    }
    ProviderError::Other(text.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(raw: &str) -> ProviderResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| ProviderError::Other(format!("unexpected control-plane response: {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksResponse {
    stacks: Vec<RawStack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStack {
    stack_name: String,
    stack_status: String,
    creation_time: Option<DateTime<Utc>>,
    last_updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    outputs: Vec<RawOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOutput {
    output_key: String,
    output_value: String,
    export_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStackEventsResponse {
    stack_events: Vec<RawEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEvent {
    event_id: String,
    timestamp: DateTime<Utc>,
    logical_resource_id: String,
    resource_type: String,
    resource_status: String,
    resource_status_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetTemplateResponse {
    template_body: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListImportsResponse {
    #[serde(default)]
    imports: Vec<String>,
}

#[async_trait]
impl StackProvider for AwsCliProvider {
    async fn describe_stack(&self, region: &str, name: &str) -> ProviderResult<StackDescription> {
        let raw = self
            .invoke(region, &["describe-stacks", "--stack-name", name])
            .await?;
        let response: DescribeStacksResponse = parse(&raw)?;
        let stack = response
            .stacks
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::StackNotFound(name.to_string()))?;
        Ok(StackDescription {
            name: stack.stack_name,
            status: StackStatus::new(stack.stack_status),
            creation_time: stack.creation_time,
            last_updated_time: stack.last_updated_time,
            outputs: stack
                .outputs
                .into_iter()
                .map(|o| StackOutput {
                    key: o.output_key,
                    value: o.output_value,
                    export_name: o.export_name,
                })
                .collect(),
        })
    }

    async fn describe_stack_events(
        &self,
        region: &str,
        name: &str,
    ) -> ProviderResult<Vec<StackEvent>> {
        let raw = self
            .invoke(region, &["describe-stack-events", "--stack-name", name])
            .await?;
        let response: DescribeStackEventsResponse = parse(&raw)?;
        Ok(response
            .stack_events
            .into_iter()
            .map(|e| StackEvent {
                event_id: e.event_id,
                timestamp: e.timestamp,
                logical_resource_id: e.logical_resource_id,
                resource_type: e.resource_type,
                resource_status: e.resource_status,
                resource_status_reason: e.resource_status_reason,
            })
            .collect())
    }

    async fn get_template(&self, region: &str, name: &str) -> ProviderResult<String> {
        let raw = self
            .invoke(region, &["get-template", "--stack-name", name])
            .await?;
        let response: GetTemplateResponse = parse(&raw)?;
        // The CLI inlines JSON templates as an object and YAML ones as a string.
        match response.template_body {
            serde_json::Value::String(body) => Ok(body),
            value => serde_json::to_string(&value)
                .map_err(|e| ProviderError::Other(format!("unreadable template body: {e}"))),
        }
    }

    async fn list_imports(&self, region: &str, export_name: &str) -> ProviderResult<Vec<String>> {
        let result = self
            .invoke(region, &["list-imports", "--export-name", export_name])
            .await;
        match result {
            Ok(raw) => {
                let response: ListImportsResponse = parse(&raw)?;
                Ok(response.imports)
            }
            Err(ProviderError::Validation { message, .. })
                if message.contains("is not imported") =>
            {
                Ok(vec![])
            }
            Err(err) => Err(err),
        }
    }

    async fn create_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()> {
        let input = request.to_string();
        self.invoke(region, &["create-stack", "--cli-input-json", &input])
            .await?;
        Ok(())
    }

    async fn update_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()> {
        let input = request.to_string();
        self.invoke(region, &["update-stack", "--cli-input-json", &input])
            .await?;
        Ok(())
    }

    async fn delete_stack(&self, region: &str, name: &str) -> ProviderResult<()> {
        self.invoke(region, &["delete-stack", "--stack-name", name])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found() {
        let err = classify(
            "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id app-dev-db does not exist",
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn classifies_throttling() {
        let err = classify(
            "An error occurred (Throttling) when calling the DescribeStacks operation: Rate exceeded",
        );
        assert_eq!(err, ProviderError::Throttled);
        assert!(err.is_retryable());
    }

    #[test]
    fn classifies_no_updates_as_validation() {
        let err = classify(
            "An error occurred (ValidationError) when calling the UpdateStack operation: No updates are to be performed.",
        );
        assert!(err.is_no_updates());
    }

    #[test]
    fn unknown_errors_are_opaque() {
        let err = classify("something unexpected");
        assert_eq!(err, ProviderError::Other("something unexpected".to_string()));
        assert!(!err.is_retryable());
    }
}
