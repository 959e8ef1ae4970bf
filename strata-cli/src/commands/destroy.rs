use super::{build_orchestrator, format_duration};
use anyhow::anyhow;
use colored::Colorize;
use std::io::Write;
use strata_core::scheduler::DestroyRun;
use strata_core::{DestroyStatus, OrchestratorConfig, Result};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct DestroyRow {
    #[tabled(rename = "STACK")]
    stack: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "DURATION")]
    duration: String,
}

pub async fn run(config: OrchestratorConfig, target: Option<&str>, force: bool) -> Result<()> {
    let orchestrator = build_orchestrator(&config);
    let mut run = orchestrator.destroy_init(target)?;

    if !force && !confirm(run.stacks().len())? {
        println!("Aborted.");
        return Ok(());
    }
    println!(
        "{} {} stack(s)",
        "Removing".yellow().bold(),
        run.stacks().len()
    );

    let mut seen_events = 0;
    loop {
        if orchestrator.destroy_poll(&mut run).await? {
            break;
        }
        let events = run.event_count();
        if events == seen_events {
            println!("Checking destroy status...");
        }
        seen_events = events;
        tokio::time::sleep(config.poll_interval()).await;
    }

    print_summary(&run);

    let failed = run
        .stacks()
        .iter()
        .filter(|s| s.status == DestroyStatus::Failed)
        .count();
    if failed > 0 {
        return Err(anyhow!("{failed} stack(s) failed to be removed").into());
    }
    Ok(())
}

fn confirm(count: usize) -> Result<bool> {
    print!("This will remove {count} stack(s). Continue? [y/N] ");
    std::io::stdout()
        .flush()
        .map_err(|e| anyhow!("failed to flush stdout: {e}"))?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .map_err(|e| anyhow!("failed to read confirmation: {e}"))?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_summary(run: &DestroyRun) {
    let rows: Vec<DestroyRow> = run
        .stacks()
        .iter()
        .map(|state| DestroyRow {
            stack: state.descriptor.name.clone(),
            status: describe_status(state.status).to_string(),
            duration: format_duration(state.started_at, state.ended_at),
        })
        .collect();
    println!("\n{}", Table::new(rows).with(Style::rounded()));

    for state in run.stacks() {
        match state.status {
            DestroyStatus::Succeeded => {
                println!("{} {}", "✅".green(), state.descriptor.name.bold());
            }
            DestroyStatus::Failed => {
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

fn describe_status(status: DestroyStatus) -> &'static str {
    match status {
        DestroyStatus::Succeeded => "removed",
        DestroyStatus::Failed => "failed",
        DestroyStatus::Skipped => "not removed",
        DestroyStatus::Pending => "pending",
        DestroyStatus::Removing => "removing",
    }
}
