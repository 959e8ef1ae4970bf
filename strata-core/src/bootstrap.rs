//! Bootstrap recovery
//!
//! An interrupted bootstrap leaves the per-region bootstrap stack parked
//! in `REVIEW_IN_PROGRESS`, where every later bootstrap attempt wedges.
//! Before the first stack of a region is dispatched, the scheduler runs
//! this check and deletes the carcass if it has sat there past the grace
//! period.

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::provider::StackProvider;
use chrono::Utc;
use tracing::{debug, warn};

pub async fn clear_stuck_bootstrap(
    provider: &dyn StackProvider,
    config: &OrchestratorConfig,
    region: &str,
) -> Result<()> {
    let described = match provider
        .describe_stack(region, &config.bootstrap_stack_name)
        .await
    {
        Ok(described) => described,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if !described.status.is_review_in_progress() {
        return Ok(());
    }

    let anchor = described.creation_time.unwrap_or_else(Utc::now);
    let age = Utc::now() - anchor;
    if age <= config.bootstrap_grace() {
        debug!(
            region,
            stack = %config.bootstrap_stack_name,
            "Bootstrap stack in review but within grace period, leaving it"
        );
        return Ok(());
    }

    warn!(
        region,
        stack = %config.bootstrap_stack_name,
        age_secs = age.num_seconds(),
        "Deleting bootstrap stack stuck in review"
    );
    provider
        .delete_stack(region, &config.bootstrap_stack_name)
        .await?;
    Ok(())
}
