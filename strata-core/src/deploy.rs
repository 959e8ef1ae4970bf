//! Deploy executor
//!
//! Owns a single stack's deployment: the no-op fast path, the export
//! guard, starting the action (through the toolkit or straight through
//! the control plane) and the per-tick progress probe. All state lives in
//! the scheduler; the executor only reports what happened.

use crate::config::{DeployStrategy, OrchestratorConfig};
use crate::error::{Result, StrataError};
use crate::events::EventLog;
use crate::exports;
use crate::manifest::StackDescriptor;
use crate::provider::{StackDescription, StackEvent, StackProvider};
use crate::template;
use crate::toolkit::{ActionOutcome, ToolkitInvoker};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// How an attempted deployment came out of its start phase.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
    /// The control plane took over; poll for completion.
    Deploying,
    /// Nothing to do, the deployed stack is already current.
    Unchanged,
    Failed(FailureCause),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The stack synthesized to an empty template and does not exist yet.
    NoResources,
    /// The target environment is missing its bootstrap stack.
    NotBootstrapped,
    /// Anything else; carries the toolkit's captured output.
    Output(String),
}

#[derive(Debug, Clone)]
pub struct DeployStart {
    pub outcome: DeployOutcome,
    pub outputs: BTreeMap<String, String>,
    pub exports: BTreeMap<String, String>,
}

impl DeployStart {
    fn bare(outcome: DeployOutcome) -> Self {
        Self {
            outcome,
            outputs: BTreeMap::new(),
            exports: BTreeMap::new(),
        }
    }

    fn with_description(outcome: DeployOutcome, description: &StackDescription) -> Self {
        Self {
            outcome,
            outputs: description.outputs_map(),
            exports: description.exports_map(),
        }
    }
}

/// Per-tick progress of an in-flight deployment.
#[derive(Debug, Clone)]
pub struct ProgressReport {
    /// Events never surfaced before, chronological.
    pub fresh_events: Vec<StackEvent>,
    pub progress: Progress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    InProgress,
    Succeeded {
        outputs: BTreeMap<String, String>,
        exports: BTreeMap<String, String>,
    },
    Failed {
        message: String,
    },
}

/// Per-stack command file the toolkit synthesizes next to the template,
/// holding the provider-native request for the template fast path.
#[derive(Deserialize)]
struct CommandFile {
    #[serde(rename = "isUpdate", default)]
    is_update: bool,
    params: serde_json::Value,
}

pub struct DeployExecutor {
    provider: Arc<dyn StackProvider>,
    invoker: Arc<dyn ToolkitInvoker>,
    config: OrchestratorConfig,
}

impl DeployExecutor {
    pub fn new(
        provider: Arc<dyn StackProvider>,
        invoker: Arc<dyn ToolkitInvoker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            invoker,
            config,
        }
    }

    /// Start deploying one stack. Returns once the operation is running
    /// on the control plane, or sooner when there is nothing to run.
    #[instrument(skip(self, stack), fields(stack = %stack.name))]
    pub async fn start(&self, stack: &StackDescriptor) -> Result<DeployStart> {
        match self.config.strategy {
            DeployStrategy::Toolkit => self.start_toolkit(stack).await,
            DeployStrategy::Template => self.start_template(stack).await,
        }
    }

    async fn start_toolkit(&self, stack: &StackDescriptor) -> Result<DeployStart> {
        let mut described = self.describe(stack, "deployed").await?;
        let baseline = described.as_ref().and_then(|d| d.last_updated_time);

        if let Some(description) = &described {
            exports::preserve_exports(
                self.provider.as_ref(),
                &self.config.out_dir,
                stack,
                description,
            )
            .await;

            if let Ok(local) = template::read_local_template(&self.config.out_dir, &stack.id) {
                if template::is_unchanged(self.provider.as_ref(), &stack.region, description, &local)
                    .await
                {
                    info!(stack = %stack.name, "Deployed template is current, skipping");
                    return Ok(DeployStart::with_description(
                        DeployOutcome::Unchanged,
                        description,
                    ));
                }
            }
        }

        let mut handle = self.invoker.deploy(stack).await?;
        loop {
            let mut waiting_for_start = false;
            match self.provider.describe_stack(&stack.region, &stack.name).await {
                Ok(description) => {
                    if description.status.is_review_in_progress()
                        || description.status.is_delete_in_progress()
                    {
                        // The operation is about to start; the previous
                        // incarnation is still being torn down or reviewed.
                        waiting_for_start = true;
                    } else {
                        let started = description.status.is_in_progress()
                            || description.last_updated_time > baseline;
                        if started {
                            debug!(stack = %stack.name, status = %description.status, "Control plane took over, releasing toolkit");
                            handle.kill().await?;
                            return Ok(DeployStart::with_description(
                                DeployOutcome::Deploying,
                                &description,
                            ));
                        }
                    }
                    described = Some(description);
                }
                Err(err) if err.is_not_found() => described = None,
                Err(err) if err.is_retryable() => {
                    // Transient; probe again next turn.
                }
                Err(err) => return Err(err.into()),
            }

            if !waiting_for_start {
                if let Some(outcome) = handle.try_status().await? {
                    return Ok(classify_exit(outcome, described.as_ref()));
                }
            }
            tokio::time::sleep(self.config.action_poll()).await;
        }
    }

    async fn start_template(&self, stack: &StackDescriptor) -> Result<DeployStart> {
        self.describe(stack, "deployed").await?;

        let mut no_changes = false;
        match self.read_command_file(stack)? {
            None => no_changes = true,
            Some(command) if command.is_update => {
                match self
                    .provider
                    .update_stack(&stack.region, &command.params)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_no_updates() => no_changes = true,
                    Err(err) => return Err(err.into()),
                }
            }
            Some(command) => {
                self.provider
                    .create_stack(&stack.region, &command.params)
                    .await?;
            }
        }

        match self.describe(stack, "deployed").await? {
            None => Ok(DeployStart::bare(DeployOutcome::Failed(
                FailureCause::NoResources,
            ))),
            Some(description) if no_changes => Ok(DeployStart::with_description(
                DeployOutcome::Unchanged,
                &description,
            )),
            Some(description) => Ok(DeployStart::with_description(
                DeployOutcome::Deploying,
                &description,
            )),
        }
    }

    /// One progress probe for a stack the control plane is working on.
    /// Event fetch failures are tolerated; the log catches up next tick.
    pub async fn check_progress(
        &self,
        stack: &StackDescriptor,
        log: &mut EventLog,
    ) -> ProgressReport {
        let mut fresh_events = Vec::new();
        match self
            .provider
            .describe_stack_events(&stack.region, &stack.name)
            .await
        {
            Ok(events) => fresh_events = log.ingest(events),
            Err(err) => debug!(stack = %stack.name, error = %err, "Event fetch failed, retrying next tick"),
        }

        let progress = match self.provider.describe_stack(&stack.region, &stack.name).await {
            Ok(description) => {
                if description.status.is_in_progress() {
                    Progress::InProgress
                } else if description.status.is_deploy_complete() {
                    Progress::Succeeded {
                        outputs: description.outputs_map(),
                        exports: description.exports_map(),
                    }
                } else if description.status.is_rollback() {
                    Progress::Failed {
                        message: format!(
                            "The {} stack failed creation, it may need to be manually deleted from the console: {}",
                            stack.name, description.status
                        ),
                    }
                } else {
                    Progress::Failed {
                        message: log.failure_reason().unwrap_or_else(|| {
                            format!(
                                "The {} stack failed to deploy: {}",
                                stack.name, description.status
                            )
                        }),
                    }
                }
            }
            Err(err) if err.is_retryable() => Progress::InProgress,
            Err(err) if err.is_not_found() => Progress::Failed {
                message: format!("The {} stack was removed while it was deploying.", stack.name),
            },
            Err(err) => Progress::Failed {
                message: err.to_string(),
            },
        };

        ProgressReport {
            fresh_events,
            progress,
        }
    }

    /// Pre-flight describe. `None` means the stack does not exist yet;
    /// an in-progress stack refuses new work.
    async fn describe(
        &self,
        stack: &StackDescriptor,
        action: &'static str,
    ) -> Result<Option<StackDescription>> {
        match self.provider.describe_stack(&stack.region, &stack.name).await {
            Ok(description) => {
                if description.status.is_in_progress() {
                    return Err(StrataError::StackBusy {
                        stack: stack.name.clone(),
                        status: description.status.to_string(),
                        action,
                    });
                }
                Ok(Some(description))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_command_file(&self, stack: &StackDescriptor) -> Result<Option<CommandFile>> {
        let path = self.config.out_dir.join(format!("{}.command", stack.id));
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StrataError::Io { path, source }),
        }
    }
}

/// The toolkit exited before the control plane started anything.
fn classify_exit(outcome: ActionOutcome, described: Option<&StackDescription>) -> DeployStart {
    if outcome.success {
        return match described {
            // Clean exit with no operation started: already up to date.
            Some(description) => {
                DeployStart::with_description(DeployOutcome::Unchanged, description)
            }
            // Clean exit but the stack never existed: empty template.
            None => DeployStart::bare(DeployOutcome::Failed(FailureCause::NoResources)),
        };
    }
    if outcome.not_bootstrapped() {
        return DeployStart::bare(DeployOutcome::Failed(FailureCause::NotBootstrapped));
    }
    DeployStart::bare(DeployOutcome::Failed(FailureCause::Output(
        outcome.output.trim().to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{StackOutput, StackStatus};

    fn described(status: &str) -> StackDescription {
        StackDescription {
            name: "app-dev-db".into(),
            status: StackStatus::new(status),
            creation_time: None,
            last_updated_time: None,
            outputs: vec![StackOutput {
                key: "TableName".into(),
                value: "app-dev-db-table".into(),
                export_name: None,
            }],
        }
    }

    #[test]
    fn clean_exit_with_existing_stack_is_unchanged() {
        let start = classify_exit(
            ActionOutcome {
                success: true,
                output: String::new(),
            },
            Some(&described("UPDATE_COMPLETE")),
        );
        assert_eq!(start.outcome, DeployOutcome::Unchanged);
        assert_eq!(start.outputs["TableName"], "app-dev-db-table");
    }

    #[test]
    fn clean_exit_without_stack_means_no_resources() {
        let start = classify_exit(
            ActionOutcome {
                success: true,
                output: String::new(),
            },
            None,
        );
        assert_eq!(
            start.outcome,
            DeployOutcome::Failed(FailureCause::NoResources)
        );
    }

    #[test]
    fn bootstrap_marker_maps_to_not_bootstrapped() {
        let start = classify_exit(
            ActionOutcome {
                success: false,
                output: "This stack uses assets, so the toolkit stack must be deployed".into(),
            },
            None,
        );
        assert_eq!(
            start.outcome,
            DeployOutcome::Failed(FailureCause::NotBootstrapped)
        );
    }

    #[test]
    fn other_failures_carry_the_output() {
        let start = classify_exit(
            ActionOutcome {
                success: false,
                output: "  Resource handler returned message: access denied\n".into(),
            },
            Some(&described("UPDATE_COMPLETE")),
        );
        assert_eq!(
            start.outcome,
            DeployOutcome::Failed(FailureCause::Output(
                "Resource handler returned message: access denied".into()
            ))
        );
    }
}
