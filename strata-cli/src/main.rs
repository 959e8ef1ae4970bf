mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use strata_core::{DeployStrategy, OrchestratorConfig, Result};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Dependency-ordered stack deployments"
)]
struct Cli {
    /// Synthesis output directory holding the manifest and templates
    #[arg(long, global = true, default_value = "out")]
    out: PathBuf,

    /// Config file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy every stack in dependency order
    Deploy {
        /// Deploy a single stack, assuming its dependencies are in place
        #[arg(long)]
        stack: Option<String>,

        /// Submit pre-synthesized templates directly, skipping the toolkit
        #[arg(long)]
        use_templates: bool,
    },
    /// Remove every stack in reverse dependency order
    Destroy {
        /// Remove a single stack
        #[arg(long)]
        stack: Option<String>,

        /// Delete through the control plane directly, skipping the toolkit
        #[arg(long)]
        use_templates: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{} {err}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "strata_core=debug,strata=debug"
    } else {
        "strata_core=info,strata=info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    config.out_dir = cli.out.clone();

    match cli.command {
        Commands::Deploy {
            stack,
            use_templates,
        } => {
            if use_templates {
                config.strategy = DeployStrategy::Template;
            }
            commands::deploy::run(config, stack.as_deref()).await
        }
        Commands::Destroy {
            stack,
            use_templates,
            force,
        } => {
            if use_templates {
                config.strategy = DeployStrategy::Template;
            }
            commands::destroy::run(config, stack.as_deref(), force).await
        }
    }
}
