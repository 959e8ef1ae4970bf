//! Orchestration scheduler
//!
//! Drives a whole app's worth of stacks through deployment or teardown.
//! Every poll tick is two passes: refresh every in-flight stack from the
//! control plane, then dispatch every pending stack whose dependencies
//! have settled. Stack state is only ever mutated here; executors report
//! outcomes, the scheduler writes them down.

use crate::bootstrap;
use crate::config::OrchestratorConfig;
use crate::deploy::{DeployExecutor, DeployOutcome, FailureCause, Progress};
use crate::destroy::{self, DestroyExecutor, DestroyOutcome};
use crate::error::{Result, StrataError};
use crate::events::EventLog;
use crate::manifest::{ManifestReader, StackDescriptor};
use crate::provider::{StackEvent, StackProvider};
use crate::toolkit::ToolkitInvoker;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStatus {
    Pending,
    Deploying,
    Succeeded,
    Unchanged,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyStatus {
    Pending,
    Removing,
    Succeeded,
    Failed,
    Skipped,
}

/// Shared shape of the two status enums, so run bookkeeping is written
/// once.
pub trait StatusKind: Copy + PartialEq + fmt::Debug + fmt::Display + Send {
    const PENDING: Self;
    const FAILED: Self;
    const SKIPPED: Self;

    /// Pending or in-flight: a status that holds dependents back.
    fn is_blocking(self) -> bool;

    fn is_terminal(self) -> bool {
        !self.is_blocking()
    }
}

impl DeployStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployStatus::Pending => "pending",
            DeployStatus::Deploying => "deploying",
            DeployStatus::Succeeded => "succeeded",
            DeployStatus::Unchanged => "unchanged",
            DeployStatus::Failed => "failed",
            DeployStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StatusKind for DeployStatus {
    const PENDING: Self = DeployStatus::Pending;
    const FAILED: Self = DeployStatus::Failed;
    const SKIPPED: Self = DeployStatus::Skipped;

    fn is_blocking(self) -> bool {
        matches!(self, DeployStatus::Pending | DeployStatus::Deploying)
    }
}

impl DestroyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DestroyStatus::Pending => "pending",
            DestroyStatus::Removing => "removing",
            DestroyStatus::Succeeded => "succeeded",
            DestroyStatus::Failed => "failed",
            DestroyStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for DestroyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StatusKind for DestroyStatus {
    const PENDING: Self = DestroyStatus::Pending;
    const FAILED: Self = DestroyStatus::Failed;
    const SKIPPED: Self = DestroyStatus::Skipped;

    fn is_blocking(self) -> bool {
        matches!(self, DestroyStatus::Pending | DestroyStatus::Removing)
    }
}

/// Everything the scheduler tracks about one stack across a run.
#[derive(Debug, Clone)]
pub struct StackState<S> {
    pub descriptor: StackDescriptor,
    pub status: S,
    /// Dependency edges for this run's direction. Deploys follow the
    /// manifest's edges; destroys follow them reversed.
    pub dependencies: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outputs: BTreeMap<String, String>,
    pub exports: BTreeMap<String, String>,
    pub error_message: Option<String>,
    pub log: EventLog,
}

impl<S: StatusKind> StackState<S> {
    fn new(descriptor: StackDescriptor, dependencies: Vec<String>) -> Self {
        Self {
            descriptor,
            status: S::PENDING,
            dependencies,
            started_at: None,
            ended_at: None,
            outputs: BTreeMap::new(),
            exports: BTreeMap::new(),
            error_message: None,
            log: EventLog::new(),
        }
    }

    fn finish(&mut self, status: S) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    fn fail(&mut self, message: String) {
        self.error_message = Some(message);
        self.finish(S::FAILED);
    }
}

fn skip_pending<S: StatusKind>(stacks: &mut [StackState<S>]) {
    for state in stacks.iter_mut().filter(|s| s.status == S::PENDING) {
        debug!(stack = %state.descriptor.name, "Skipping, a dependency failed");
        state.finish(S::SKIPPED);
    }
}

fn total_events<S>(stacks: &[StackState<S>]) -> usize {
    stacks.iter().map(|s| s.log.len()).sum()
}

/// State of one deployment run. Created by [`Orchestrator::deploy_init`]
/// and advanced one tick at a time by [`Orchestrator::deploy_poll`].
#[derive(Debug)]
pub struct DeployRun {
    stacks: Vec<StackState<DeployStatus>>,
    recovered_regions: HashSet<String>,
}

impl DeployRun {
    pub fn new(descriptors: Vec<StackDescriptor>) -> Self {
        Self {
            stacks: descriptors
                .into_iter()
                .map(|d| {
                    let dependencies = d.dependencies.clone();
                    StackState::new(d, dependencies)
                })
                .collect(),
            recovered_regions: HashSet::new(),
        }
    }

    pub fn stacks(&self) -> &[StackState<DeployStatus>] {
        &self.stacks
    }

    pub fn is_completed(&self) -> bool {
        self.stacks.iter().all(|s| s.status.is_terminal())
    }

    /// Total events surfaced so far, across all stacks. Lets callers
    /// notice quiet ticks.
    pub fn event_count(&self) -> usize {
        total_events(&self.stacks)
    }
}

/// State of one teardown run.
#[derive(Debug)]
pub struct DestroyRun {
    stacks: Vec<StackState<DestroyStatus>>,
}

impl DestroyRun {
    /// Dependency edges are reversed: a stack may only go down once every
    /// stack depending on it is gone.
    pub fn new(descriptors: Vec<StackDescriptor>) -> Self {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for descriptor in &descriptors {
            for dependency in &descriptor.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(descriptor.id.clone());
            }
        }
        Self {
            stacks: descriptors
                .into_iter()
                .map(|d| {
                    let reversed = dependents.remove(&d.id).unwrap_or_default();
                    StackState::new(d, reversed)
                })
                .collect(),
        }
    }

    pub fn stacks(&self) -> &[StackState<DestroyStatus>] {
        &self.stacks
    }

    pub fn is_completed(&self) -> bool {
        self.stacks.iter().all(|s| s.status.is_terminal())
    }

    pub fn event_count(&self) -> usize {
        total_events(&self.stacks)
    }
}

enum DispatchEffect {
    Idle,
    Succeeded,
    Failed,
    NeedsBootstrap { region: String },
}

pub struct Orchestrator {
    provider: Arc<dyn StackProvider>,
    invoker: Arc<dyn ToolkitInvoker>,
    config: OrchestratorConfig,
}

impl Orchestrator {
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

    /// Read the manifest and set up a deployment run. With a target, only
    /// that stack deploys and its dependencies are assumed in place.
    pub fn deploy_init(&self, target: Option<&str>) -> Result<DeployRun> {
        Ok(DeployRun::new(self.descriptors(target)?))
    }

    pub fn destroy_init(&self, target: Option<&str>) -> Result<DestroyRun> {
        Ok(DestroyRun::new(self.descriptors(target)?))
    }

    fn descriptors(&self, target: Option<&str>) -> Result<Vec<StackDescriptor>> {
        let stacks = ManifestReader::read(&self.config.out_dir, &self.config.default_region)?;
        match target {
            Some(stack_id) => ManifestReader::narrow(stacks, stack_id),
            None => Ok(stacks),
        }
    }

    /// One deployment tick. Returns whether the run is complete.
    pub async fn deploy_poll(&self, run: &mut DeployRun) -> Result<bool> {
        self.recover_bootstrap(run).await;
        self.update_deploy_statuses(run).await;
        self.dispatch_deploys(run).await;
        Ok(run.is_completed())
    }

    /// One teardown tick. Returns whether the run is complete.
    pub async fn destroy_poll(&self, run: &mut DestroyRun) -> Result<bool> {
        self.update_destroy_statuses(run).await;
        self.dispatch_destroys(run).await;
        Ok(run.is_completed())
    }

    /// Clear any bootstrap stack stuck in review, once per region per
    /// run, before that region sees its first dispatch. Failure here is
    /// not fatal; a genuinely wedged bootstrap surfaces on its own later.
    async fn recover_bootstrap(&self, run: &mut DeployRun) {
        let regions: HashSet<String> = run
            .stacks
            .iter()
            .map(|s| s.descriptor.region.clone())
            .collect();
        for region in regions {
            if !run.recovered_regions.insert(region.clone()) {
                continue;
            }
            if let Err(err) =
                bootstrap::clear_stuck_bootstrap(self.provider.as_ref(), &self.config, &region)
                    .await
            {
                warn!(region = %region, error = %err, "Bootstrap recovery check failed");
            }
        }
    }

    fn deploy_executor(&self) -> DeployExecutor {
        DeployExecutor::new(
            self.provider.clone(),
            self.invoker.clone(),
            self.config.clone(),
        )
    }

    fn destroy_executor(&self) -> DestroyExecutor {
        DestroyExecutor::new(
            self.provider.clone(),
            self.invoker.clone(),
            self.config.clone(),
        )
    }

    async fn update_deploy_statuses(&self, run: &mut DeployRun) {
        let executor = self.deploy_executor();
        let executor = &executor;
        let results = join_all(
            run.stacks
                .iter_mut()
                .filter(|s| s.status == DeployStatus::Deploying)
                .map(|state| async move {
                    let report = executor.check_progress(&state.descriptor, &mut state.log).await;
                    for event in &report.fresh_events {
                        emit_event(&state.descriptor.name, event);
                    }
                    match report.progress {
                        Progress::InProgress => false,
                        Progress::Succeeded { outputs, exports } => {
                            state.outputs = outputs;
                            state.exports = exports;
                            state.finish(DeployStatus::Succeeded);
                            info!(stack = %state.descriptor.name, "Stack deployed");
                            false
                        }
                        Progress::Failed { message } => {
                            info!(stack = %state.descriptor.name, error = %message, "Stack failed to deploy");
                            state.fail(message);
                            true
                        }
                    }
                }),
        )
        .await;

        if results.into_iter().any(|failed| failed) {
            skip_pending(&mut run.stacks);
        }
    }

    /// Start every pending stack whose dependencies have settled. When a
    /// dispatch resolves synchronously (an unchanged stack), newly
    /// unblocked stacks start in the same tick instead of waiting out a
    /// poll interval.
    async fn dispatch_deploys(&self, run: &mut DeployRun) {
        let executor = self.deploy_executor();
        let executor = &executor;
        loop {
            let eligible = eligible_ids(&run.stacks);
            if eligible.is_empty() {
                return;
            }

            let effects = join_all(
                run.stacks
                    .iter_mut()
                    .filter(|s| eligible.contains(&s.descriptor.id))
                    .map(|state| async move {
                        let id = state.descriptor.id.clone();
                        let effect = dispatch_deploy(executor, state).await;
                        (id, effect)
                    }),
            )
            .await;

            let mut any_succeeded = false;
            let mut any_failed = false;
            let mut bootstrap_requests: Vec<(String, String)> = Vec::new();
            for (id, effect) in effects {
                match effect {
                    DispatchEffect::Idle => {}
                    DispatchEffect::Succeeded => any_succeeded = true,
                    DispatchEffect::Failed => any_failed = true,
                    DispatchEffect::NeedsBootstrap { region } => {
                        bootstrap_requests.push((id, region))
                    }
                }
            }

            if self.run_bootstraps(run, &bootstrap_requests).await {
                any_failed = true;
            }
            if any_failed {
                skip_pending(&mut run.stacks);
            }
            if !any_succeeded {
                return;
            }
        }
    }

    /// Bootstrap each region that asked for it, serially. Requesting
    /// stacks stay pending on success and retryable failure; a hard
    /// failure takes them down. Returns whether anything hard-failed.
    async fn run_bootstraps(&self, run: &mut DeployRun, requests: &[(String, String)]) -> bool {
        let mut regions: Vec<&str> = requests.iter().map(|(_, region)| region.as_str()).collect();
        regions.sort_unstable();
        regions.dedup();

        let mut any_failed = false;
        for region in regions {
            match self.invoker.bootstrap(region).await {
                Ok(()) => info!(region = %region, "Environment bootstrapped"),
                Err(StrataError::Provider(err)) if err.is_retryable() => {
                    debug!(region = %region, error = %err, "Bootstrap throttled, retrying next tick");
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(region = %region, error = %message, "Bootstrap failed");
                    for (id, request_region) in requests {
                        if request_region.as_str() != region {
                            continue;
                        }
                        if let Some(state) =
                            run.stacks.iter_mut().find(|s| s.descriptor.id == *id)
                        {
                            state.fail(message.clone());
                        }
                    }
                    any_failed = true;
                }
            }
        }
        any_failed
    }

    async fn update_destroy_statuses(&self, run: &mut DestroyRun) {
        let executor = self.destroy_executor();
        let executor = &executor;
        let results = join_all(
            run.stacks
                .iter_mut()
                .filter(|s| s.status == DestroyStatus::Removing)
                .map(|state| async move {
                    let report = executor.check_progress(&state.descriptor, &mut state.log).await;
                    for event in &report.fresh_events {
                        emit_event(&state.descriptor.name, event);
                    }
                    match report.progress {
                        destroy::Progress::InProgress => false,
                        destroy::Progress::Destroyed => {
                            state.finish(DestroyStatus::Succeeded);
                            info!(stack = %state.descriptor.name, "Stack removed");
                            false
                        }
                        destroy::Progress::Failed { message } => {
                            info!(stack = %state.descriptor.name, error = %message, "Stack failed to be removed");
                            state.fail(message);
                            true
                        }
                    }
                }),
        )
        .await;

        if results.into_iter().any(|failed| failed) {
            skip_pending(&mut run.stacks);
        }
    }

    async fn dispatch_destroys(&self, run: &mut DestroyRun) {
        let executor = self.destroy_executor();
        let executor = &executor;
        loop {
            let eligible = eligible_ids(&run.stacks);
            if eligible.is_empty() {
                return;
            }

            let effects = join_all(
                run.stacks
                    .iter_mut()
                    .filter(|s| eligible.contains(&s.descriptor.id))
                    .map(|state| async move { dispatch_destroy(executor, state).await }),
            )
            .await;

            let mut any_succeeded = false;
            let mut any_failed = false;
            for effect in effects {
                match effect {
                    DispatchEffect::Succeeded => any_succeeded = true,
                    DispatchEffect::Failed => any_failed = true,
                    _ => {}
                }
            }

            if any_failed {
                skip_pending(&mut run.stacks);
            }
            if !any_succeeded {
                return;
            }
        }
    }
}

/// Pending stacks whose every dependency has settled. Edges pointing out
/// of the run (trimmed by single-stack mode) never block.
fn eligible_ids<S: StatusKind>(stacks: &[StackState<S>]) -> HashSet<String> {
    let statuses: HashMap<&str, S> = stacks
        .iter()
        .map(|s| (s.descriptor.id.as_str(), s.status))
        .collect();
    stacks
        .iter()
        .filter(|s| s.status == S::PENDING)
        .filter(|s| {
            s.dependencies
                .iter()
                .all(|dep| statuses.get(dep.as_str()).map_or(true, |st| !st.is_blocking()))
        })
        .map(|s| s.descriptor.id.clone())
        .collect()
}

async fn dispatch_deploy(
    executor: &DeployExecutor,
    state: &mut StackState<DeployStatus>,
) -> DispatchEffect {
    let name = state.descriptor.name.clone();
    match executor.start(&state.descriptor).await {
        Ok(start) => {
            state.started_at = Some(Utc::now());
            match start.outcome {
                DeployOutcome::Deploying => {
                    state.status = DeployStatus::Deploying;
                    info!(stack = %name, "Deploying stack");
                    DispatchEffect::Idle
                }
                DeployOutcome::Unchanged => {
                    state.outputs = start.outputs;
                    state.exports = start.exports;
                    state.finish(DeployStatus::Unchanged);
                    info!(stack = %name, "Stack up to date");
                    DispatchEffect::Succeeded
                }
                DeployOutcome::Failed(FailureCause::NoResources) => {
                    let message = format!("The {name} stack contains no resources.");
                    info!(stack = %name, error = %message, "Stack failed to deploy");
                    state.fail(message);
                    DispatchEffect::Failed
                }
                DeployOutcome::Failed(FailureCause::NotBootstrapped) => {
                    info!(stack = %name, "Environment not bootstrapped, bootstrapping first");
                    DispatchEffect::NeedsBootstrap {
                        region: state.descriptor.region.clone(),
                    }
                }
                DeployOutcome::Failed(FailureCause::Output(output)) => {
                    let message = if output.is_empty() {
                        format!("The {name} stack failed to deploy.")
                    } else {
                        output
                    };
                    info!(stack = %name, error = %message, "Stack failed to deploy");
                    state.fail(message);
                    DispatchEffect::Failed
                }
            }
        }
        Err(StrataError::Provider(err)) if err.is_retryable() => {
            debug!(stack = %name, error = %err, "Dispatch throttled, retrying next tick");
            DispatchEffect::Idle
        }
        Err(err) => {
            let message = err.to_string();
            info!(stack = %name, error = %message, "Stack failed to deploy");
            state.fail(message);
            DispatchEffect::Failed
        }
    }
}

async fn dispatch_destroy(
    executor: &DestroyExecutor,
    state: &mut StackState<DestroyStatus>,
) -> DispatchEffect {
    let name = state.descriptor.name.clone();
    match executor.start(&state.descriptor).await {
        Ok(DestroyOutcome::Removing) => {
            state.started_at = Some(Utc::now());
            state.status = DestroyStatus::Removing;
            info!(stack = %name, "Removing stack");
            DispatchEffect::Idle
        }
        Ok(DestroyOutcome::Destroyed) => {
            state.started_at = Some(Utc::now());
            state.finish(DestroyStatus::Succeeded);
            info!(stack = %name, "Stack removed");
            DispatchEffect::Succeeded
        }
        Ok(DestroyOutcome::Failed(output)) => {
            let message = if output.is_empty() {
                format!("The {name} stack failed to be removed.")
            } else {
                output
            };
            info!(stack = %name, error = %message, "Stack failed to be removed");
            state.fail(message);
            DispatchEffect::Failed
        }
        Err(StrataError::Provider(err)) if err.is_retryable() => {
            debug!(stack = %name, error = %err, "Dispatch throttled, retrying next tick");
            DispatchEffect::Idle
        }
        Err(err) => {
            let message = err.to_string();
            info!(stack = %name, error = %message, "Stack failed to be removed");
            state.fail(message);
            DispatchEffect::Failed
        }
    }
}

fn emit_event(stack: &str, event: &StackEvent) {
    info!(
        stack,
        status = %event.resource_status,
        resource = %event.logical_resource_id,
        kind = %event.resource_type,
        reason = event.resource_status_reason.as_deref().unwrap_or(""),
        "Stack event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, dependencies: &[&str]) -> StackDescriptor {
        StackDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            region: "us-east-1".to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn destroy_run_reverses_edges() {
        let run = DestroyRun::new(vec![
            descriptor("net", &[]),
            descriptor("db", &["net"]),
            descriptor("app", &["db", "net"]),
        ]);
        let edges: HashMap<&str, &[String]> = run
            .stacks()
            .iter()
            .map(|s| (s.descriptor.id.as_str(), s.dependencies.as_slice()))
            .collect();
        assert_eq!(edges["net"], vec!["db".to_string(), "app".to_string()]);
        assert_eq!(edges["db"], vec!["app".to_string()]);
        assert!(edges["app"].is_empty());
    }

    #[test]
    fn eligibility_respects_blocking_dependencies() {
        let mut run = DeployRun::new(vec![
            descriptor("net", &[]),
            descriptor("db", &["net"]),
            descriptor("app", &["db"]),
        ]);
        assert_eq!(eligible_ids(&run.stacks), HashSet::from(["net".to_string()]));

        run.stacks[0].finish(DeployStatus::Succeeded);
        assert_eq!(eligible_ids(&run.stacks), HashSet::from(["db".to_string()]));

        run.stacks[1].status = DeployStatus::Deploying;
        assert!(eligible_ids(&run.stacks).is_empty());
    }

    #[test]
    fn unknown_dependencies_never_block() {
        let run = DeployRun::new(vec![descriptor("db", &["already-deployed"])]);
        assert_eq!(eligible_ids(&run.stacks), HashSet::from(["db".to_string()]));
    }

    #[test]
    fn failed_dependency_unblocks_but_skip_clears() {
        let mut run = DeployRun::new(vec![descriptor("net", &[]), descriptor("db", &["net"])]);
        run.stacks[0].fail("boom".to_string());
        // A failed dependency no longer blocks eligibility; the cascade
        // skip is what takes the dependent out.
        assert_eq!(eligible_ids(&run.stacks), HashSet::from(["db".to_string()]));
        skip_pending(&mut run.stacks);
        assert_eq!(run.stacks[1].status, DeployStatus::Skipped);
        assert!(run.is_completed());
    }

    #[test]
    fn completion_requires_all_terminal() {
        let mut run = DeployRun::new(vec![descriptor("net", &[])]);
        assert!(!run.is_completed());
        run.stacks[0].finish(DeployStatus::Unchanged);
        assert!(run.is_completed());
    }
}
