//! Orchestrator configuration

use crate::error::{Result, StrataError};
use crate::provider::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How single-stack deployments are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    /// Spawn the external synthesis toolkit and hand off once the
    /// control plane reports the operation started.
    #[default]
    Toolkit,
    /// Submit the pre-synthesized template directly through the
    /// control plane, driven by the per-stack command file.
    Template,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Synthesis output directory holding the manifest, templates and
    /// per-stack command files.
    pub out_dir: PathBuf,
    /// Region used for stacks whose environment does not pin one.
    pub default_region: String,
    pub strategy: DeployStrategy,
    /// Binary for the external synthesis toolkit.
    pub toolkit_bin: String,
    pub role_arn: Option<String>,
    /// Whether the toolkit should roll back failed deployments.
    pub rollback: bool,
    /// Seconds between scheduler poll ticks.
    pub poll_interval_secs: u64,
    /// Seconds between executor-internal status probes.
    pub action_poll_secs: u64,
    /// Fixed delay between retries of throttled control-plane calls.
    pub retry_delay_secs: u64,
    /// Cap on retry attempts. `None` retries until the call lands.
    pub retry_max_attempts: Option<u32>,
    /// Name of the per-region bootstrap stack.
    pub bootstrap_stack_name: String,
    /// How long a bootstrap stack may sit in review before it is
    /// considered stuck and deleted.
    pub bootstrap_grace_secs: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            default_region: "us-east-1".to_string(),
            strategy: DeployStrategy::Toolkit,
            toolkit_bin: "cdk".to_string(),
            role_arn: None,
            rollback: true,
            poll_interval_secs: 5,
            action_poll_secs: 3,
            retry_delay_secs: 3,
            retry_max_attempts: None,
            bootstrap_stack_name: "CDKToolkit".to_string(),
            bootstrap_grace_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| StrataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<Self> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| StrataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(self.retry_delay_secs),
            max_attempts: self.retry_max_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn action_poll(&self) -> Duration {
        Duration::from_secs(self.action_poll_secs)
    }

    pub fn bootstrap_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bootstrap_grace_secs)
    }
}
