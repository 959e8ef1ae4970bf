pub mod deploy;
pub mod destroy;

use std::sync::Arc;
use strata_core::provider::aws_cli::AwsCliProvider;
use strata_core::provider::retry::RetryingProvider;
use strata_core::{CdkInvoker, Orchestrator, OrchestratorConfig};

pub(crate) fn build_orchestrator(config: &OrchestratorConfig) -> Orchestrator {
    let provider = RetryingProvider::with_policy(AwsCliProvider::new(), config.retry_policy());
    let invoker = CdkInvoker::new(config);
    Orchestrator::new(Arc::new(provider), Arc::new(invoker), config.clone())
}

pub(crate) fn format_duration(
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
) -> String {
    match (started_at, ended_at) {
        (Some(start), Some(end)) => {
            let secs = (end - start).num_seconds().max(0);
            format!("{}m{}s", secs / 60, secs % 60)
        }
        _ => "-".to_string(),
    }
}
