//! Cloud control-plane abstraction
//!
//! The engine never talks to the provider SDK directly. Everything goes
//! through [`StackProvider`], which implementations back with whatever
//! transport they like, and which [`retry::RetryingProvider`] wraps to make
//! throttling invisible to callers.

pub mod aws_cli;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use crate::error::{ProviderError, ProviderResult};

/// Provider-native stack status string, e.g. `UPDATE_IN_PROGRESS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackStatus(String);

impl StackStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_in_progress(&self) -> bool {
        self.0.ends_with("_IN_PROGRESS")
    }

    pub fn is_review_in_progress(&self) -> bool {
        self.0 == "REVIEW_IN_PROGRESS"
    }

    pub fn is_delete_in_progress(&self) -> bool {
        self.0 == "DELETE_IN_PROGRESS"
    }

    /// The stack settled with its resources in place.
    pub fn is_deploy_complete(&self) -> bool {
        self.0 == "CREATE_COMPLETE" || self.0 == "UPDATE_COMPLETE"
    }

    /// A failed first creation. The stack holds no usable resources and
    /// usually has to be deleted before it can be deployed again.
    pub fn is_rollback(&self) -> bool {
        self.0 == "ROLLBACK_COMPLETE" || self.0 == "ROLLBACK_FAILED"
    }

    pub fn is_delete_complete(&self) -> bool {
        self.0 == "DELETE_COMPLETE"
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
    pub export_name: Option<String>,
}

/// Snapshot of a deployed stack as reported by the control plane.
#[derive(Debug, Clone)]
pub struct StackDescription {
    pub name: String,
    pub status: StackStatus,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_updated_time: Option<DateTime<Utc>>,
    pub outputs: Vec<StackOutput>,
}

impl StackDescription {
    pub fn outputs_map(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|o| (o.key.clone(), o.value.clone()))
            .collect()
    }

    /// Only outputs that declare an export name, keyed by that name.
    pub fn exports_map(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .filter_map(|o| {
                o.export_name
                    .as_ref()
                    .map(|name| (name.clone(), o.value.clone()))
            })
            .collect()
    }
}

/// A single resource event from the stack's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub logical_resource_id: String,
    pub resource_type: String,
    pub resource_status: String,
    pub resource_status_reason: Option<String>,
}

/// Async interface over the cloud control plane.
///
/// `describe_stack` returns [`ProviderError::StackNotFound`] when the stack
/// does not exist; callers lean on that to distinguish first creation from
/// an update. `describe_stack_events` yields events newest-first, the way
/// the provider API pages them. `list_imports` returns an empty vec when
/// nothing imports the export.
#[async_trait]
pub trait StackProvider: Send + Sync {
    async fn describe_stack(&self, region: &str, name: &str) -> ProviderResult<StackDescription>;

    async fn describe_stack_events(
        &self,
        region: &str,
        name: &str,
    ) -> ProviderResult<Vec<StackEvent>>;

    /// The template body as currently deployed.
    async fn get_template(&self, region: &str, name: &str) -> ProviderResult<String>;

    /// Names of stacks importing the given export.
    async fn list_imports(&self, region: &str, export_name: &str) -> ProviderResult<Vec<String>>;

    /// Submit a stack creation. `request` is the provider-native request
    /// body produced by the synthesis toolkit, passed through untouched.
    async fn create_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()>;

    async fn update_stack(&self, region: &str, request: &serde_json::Value) -> ProviderResult<()>;

    async fn delete_stack(&self, region: &str, name: &str) -> ProviderResult<()>;
}
