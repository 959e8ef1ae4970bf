//! strata-core: deployment orchestration engine
//!
//! Turns a synthesized app (a manifest plus per-stack templates) into a
//! sequence of control-plane operations: deploying stacks in dependency
//! order, tearing them down in reverse, tailing their events, and
//! recovering from the classic failure modes (throttling, interrupted
//! bootstraps, dropped-but-imported exports) along the way.
//!
//! The two seams are [`provider::StackProvider`] for the control plane
//! and [`toolkit::ToolkitInvoker`] for the external synthesis toolkit.
//! [`scheduler::Orchestrator`] drives everything; callers own the poll
//! cadence.

pub mod bootstrap;
pub mod config;
pub mod deploy;
pub mod destroy;
pub mod error;
pub mod events;
pub mod exports;
pub mod manifest;
pub mod provider;
pub mod scheduler;
pub mod template;
pub mod toolkit;

pub use config::{DeployStrategy, OrchestratorConfig};
pub use error::{ProviderError, Result, StrataError};
pub use manifest::{ManifestReader, StackDescriptor};
pub use provider::StackProvider;
pub use scheduler::{DeployRun, DeployStatus, DestroyRun, DestroyStatus, Orchestrator};
pub use toolkit::{CdkInvoker, ToolkitInvoker};
