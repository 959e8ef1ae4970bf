//! External synthesis toolkit integration
//!
//! Deploy and destroy actions run through the synthesis toolkit as child
//! processes. The executors only ever see [`ToolkitInvoker`] and the
//! [`ActionHandle`] it hands back, so tests swap in scripted fakes and the
//! toolkit's output scraping stays contained here.

use crate::config::OrchestratorConfig;
use crate::error::{Result, StrataError};
use crate::manifest::StackDescriptor;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Marker the toolkit prints when the target environment was never
/// bootstrapped.
const NOT_BOOTSTRAPPED_MARKER: &str =
    "This stack uses assets, so the toolkit stack must be deployed";

/// Exit state of a finished toolkit action.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    /// Combined stdout and stderr, as captured.
    pub output: String,
}

impl ActionOutcome {
    pub fn not_bootstrapped(&self) -> bool {
        self.output.contains(NOT_BOOTSTRAPPED_MARKER)
    }
}

/// A running toolkit action. `try_status` is a non-blocking probe; the
/// executors interleave it with control-plane polling and `kill` the
/// action once the control plane has taken over.
#[async_trait]
pub trait ActionHandle: Send {
    async fn try_status(&mut self) -> Result<Option<ActionOutcome>>;

    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ToolkitInvoker: Send + Sync {
    async fn deploy(&self, stack: &StackDescriptor) -> Result<Box<dyn ActionHandle>>;

    async fn destroy(&self, stack: &StackDescriptor) -> Result<Box<dyn ActionHandle>>;

    /// Run the one-time environment bootstrap for a region, blocking until
    /// it finishes.
    async fn bootstrap(&self, region: &str) -> Result<()>;
}

/// [`ToolkitInvoker`] that spawns the CDK toolkit CLI against the
/// pre-synthesized output directory.
pub struct CdkInvoker {
    bin: String,
    out_dir: PathBuf,
    role_arn: Option<String>,
    rollback: bool,
}

impl CdkInvoker {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            bin: config.toolkit_bin.clone(),
            out_dir: config.out_dir.clone(),
            role_arn: config.role_arn.clone(),
            rollback: config.rollback,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .args(args)
            .arg("--no-version-reporting")
            .arg("--app")
            .arg(&self.out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(role_arn) = &self.role_arn {
            command.args(["--role-arn", role_arn]);
        }
        command
    }

    fn spawn(&self, mut command: Command) -> Result<ProcessHandle> {
        let mut child = command.spawn().map_err(|source| StrataError::Spawn {
            tool: self.bin.clone(),
            source,
        })?;
        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, output.clone()));
        }
        Ok(ProcessHandle {
            child,
            output,
            readers,
        })
    }
}

fn capture<R>(reader: R, sink: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(toolkit = %line);
            let mut sink = sink.lock().await;
            sink.push_str(&line);
            sink.push('\n');
        }
    })
}

struct ProcessHandle {
    child: Child,
    output: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ActionHandle for ProcessHandle {
    async fn try_status(&mut self) -> Result<Option<ActionOutcome>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| anyhow::anyhow!("failed to poll toolkit process: {e}"))?;
        let Some(status) = status else {
            return Ok(None);
        };
        // Drain the capture tasks so the trailing output is all there.
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(Some(ActionOutcome {
            success: status.success(),
            output: self.output.lock().await.clone(),
        }))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| anyhow::anyhow!("failed to kill toolkit process: {e}").into())
    }
}

#[async_trait]
impl ToolkitInvoker for CdkInvoker {
    async fn deploy(&self, stack: &StackDescriptor) -> Result<Box<dyn ActionHandle>> {
        info!(stack = %stack.name, "Spawning toolkit deploy");
        let mut command = self.command(&[
            "deploy",
            &stack.name,
            "--exclusively",
            "--require-approval",
            "never",
        ]);
        command.args(["--rollback", if self.rollback { "true" } else { "false" }]);
        Ok(Box::new(self.spawn(command)?))
    }

    async fn destroy(&self, stack: &StackDescriptor) -> Result<Box<dyn ActionHandle>> {
        info!(stack = %stack.name, "Spawning toolkit destroy");
        let command = self.command(&["destroy", &stack.name, "--exclusively", "--force"]);
        Ok(Box::new(self.spawn(command)?))
    }

    async fn bootstrap(&self, region: &str) -> Result<()> {
        info!(region, "Bootstrapping environment");
        let mut command = self.command(&["bootstrap"]);
        command.env("CDK_NEW_BOOTSTRAP", "1");
        let mut handle = self.spawn(command)?;
        loop {
            if let Some(outcome) = handle.try_status().await? {
                if outcome.success {
                    return Ok(());
                }
                return Err(StrataError::BootstrapFailed {
                    region: region.to_string(),
                    reason: outcome.output.trim().to_string(),
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
}
