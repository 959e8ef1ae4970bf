use super::{build_orchestrator, format_duration};
use anyhow::anyhow;
use colored::Colorize;
use strata_core::scheduler::DeployRun;
use strata_core::{DeployStatus, OrchestratorConfig, Result};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct DeployRow {
    #[tabled(rename = "STACK")]
    stack: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DURATION")]
    duration: String,
}

pub async fn run(config: OrchestratorConfig, target: Option<&str>) -> Result<()> {
    let orchestrator = build_orchestrator(&config);
    let mut run = orchestrator.deploy_init(target)?;
    println!(
        "{} {} stack(s)",
        "Deploying".green().bold(),
        run.stacks().len()
    );

    let mut seen_events = 0;
    loop {
        if orchestrator.deploy_poll(&mut run).await? {
            break;
        }
        let events = run.event_count();
        if events == seen_events {
            println!("Checking deploy status...");
        }
        seen_events = events;
        tokio::time::sleep(config.poll_interval()).await;
    }

    print_summary(&run);

    let failed = run
        .stacks()
        .iter()
        .filter(|s| s.status == DeployStatus::Failed)
        .count();
    if failed > 0 {
        return Err(anyhow!("{failed} stack(s) failed to deploy").into());
    }
    Ok(())
}

fn print_summary(run: &DeployRun) {
    let rows: Vec<DeployRow> = run
        .stacks()
        .iter()
        .map(|state| DeployRow {
            stack: state.descriptor.name.clone(),
            status: describe_status(state.status).to_string(),
            duration: format_duration(state.started_at, state.ended_at),
        })
        .collect();
    println!("\n{}", Table::new(rows).with(Style::rounded()));

    for state in run.stacks() {
        match state.status {
            DeployStatus::Succeeded | DeployStatus::Unchanged => {
                println!("{} {}", "✅".green(), state.descriptor.name.bold());
                for (key, value) in &state.outputs {
                    println!("   {key}: {value}");
                }
            }
            DeployStatus::Failed => {
                let reason = state.error_message.as_deref().unwrap_or("unknown error");
                println!(
                    "{} {} {}",
                    "❌".red(),
                    state.descriptor.name.bold(),
                    format!("failed: {reason}").red()
                );
            }
            _ => {}
        }
    }
}

fn describe_status(status: DeployStatus) -> &'static str {
    match status {
        DeployStatus::Succeeded => "deployed",
        DeployStatus::Unchanged => "no changes",
        DeployStatus::Failed => "failed",
        DeployStatus::Skipped => "not deployed",
        DeployStatus::Pending => "pending",
        DeployStatus::Deploying => "deploying",
    }
}
