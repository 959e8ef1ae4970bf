//! Destroy executor
//!
//! Mirror of the deploy executor for teardown. A stack that does not
//! exist is already destroyed; everything else runs through the toolkit
//! or straight through the control plane's delete call.

use crate::config::{DeployStrategy, OrchestratorConfig};
use crate::error::{Result, StrataError};
use crate::events::EventLog;
use crate::manifest::StackDescriptor;
use crate::provider::{StackDescription, StackEvent, StackProvider};
use crate::toolkit::ToolkitInvoker;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq)]
pub enum DestroyOutcome {
    /// The control plane is tearing the stack down; poll for completion.
    Removing,
    /// Nothing left to remove.
    Destroyed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DestroyProgress {
    pub fresh_events: Vec<StackEvent>,
    pub progress: Progress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    InProgress,
    Destroyed,
    Failed { message: String },
}

pub struct DestroyExecutor {
    provider: Arc<dyn StackProvider>,
    invoker: Arc<dyn ToolkitInvoker>,
    config: OrchestratorConfig,
}

impl DestroyExecutor {
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

    #[instrument(skip(self, stack), fields(stack = %stack.name))]
    pub async fn start(&self, stack: &StackDescriptor) -> Result<DestroyOutcome> {
        let Some(described) = self.describe(stack).await? else {
            return Ok(DestroyOutcome::Destroyed);
        };
        match self.config.strategy {
            DeployStrategy::Toolkit => self.start_toolkit(stack, described).await,
            DeployStrategy::Template => {
                self.provider
                    .delete_stack(&stack.region, &stack.name)
                    .await?;
                Ok(DestroyOutcome::Removing)
            }
        }
    }

    async fn start_toolkit(
        &self,
        stack: &StackDescriptor,
        described: StackDescription,
    ) -> Result<DestroyOutcome> {
        let baseline = described.last_updated_time;
        let mut handle = self.invoker.destroy(stack).await?;
        loop {
            match self.provider.describe_stack(&stack.region, &stack.name).await {
                Ok(description) => {
                    let started = (description.status.is_in_progress()
                        && !description.status.is_review_in_progress())
                        || description.last_updated_time > baseline;
                    if started {
                        debug!(stack = %stack.name, status = %description.status, "Control plane took over, releasing toolkit");
                        handle.kill().await?;
                        return Ok(DestroyOutcome::Removing);
                    }
                }
                Err(err) if err.is_not_found() => {
                    handle.kill().await?;
                    return Ok(DestroyOutcome::Destroyed);
                }
                Err(err) if err.is_retryable() => {
                    // Transient; probe again next turn.
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(outcome) = handle.try_status().await? {
                return Ok(if outcome.success {
                    DestroyOutcome::Destroyed
                } else {
                    DestroyOutcome::Failed(outcome.output.trim().to_string())
                });
            }
            tokio::time::sleep(self.config.action_poll()).await;
        }
    }

    /// One progress probe for a stack being torn down. A vanished stack
    /// is a completed teardown, at every step.
    pub async fn check_progress(
        &self,
        stack: &StackDescriptor,
        log: &mut EventLog,
    ) -> DestroyProgress {
        let mut fresh_events = Vec::new();
        match self
            .provider
            .describe_stack_events(&stack.region, &stack.name)
            .await
        {
            Ok(events) => fresh_events = log.ingest(events),
            Err(err) if err.is_not_found() => {
                return DestroyProgress {
                    fresh_events,
                    progress: Progress::Destroyed,
                }
            }
            Err(err) => debug!(stack = %stack.name, error = %err, "Event fetch failed, retrying next tick"),
        }

        let progress = match self.provider.describe_stack(&stack.region, &stack.name).await {
            Ok(description) => {
                if description.status.is_in_progress() {
                    Progress::InProgress
                } else if description.status.is_delete_complete() {
                    Progress::Destroyed
                } else {
                    Progress::Failed {
                        message: log.failure_reason().unwrap_or_else(|| {
                            format!(
                                "The {} stack failed to destroy: {}",
                                stack.name, description.status
                            )
                        }),
                    }
                }
            }
            Err(err) if err.is_not_found() => Progress::Destroyed,
            Err(err) if err.is_retryable() => Progress::InProgress,
            Err(err) => Progress::Failed {
                message: err.to_string(),
            },
        };

        DestroyProgress {
            fresh_events,
            progress,
        }
    }

    async fn describe(&self, stack: &StackDescriptor) -> Result<Option<StackDescription>> {
        match self.provider.describe_stack(&stack.region, &stack.name).await {
            Ok(description) => {
                if description.status.is_in_progress() {
                    return Err(StrataError::StackBusy {
                        stack: stack.name.clone(),
                        status: description.status.to_string(),
                        action: "destroyed",
                    });
                }
                Ok(Some(description))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
