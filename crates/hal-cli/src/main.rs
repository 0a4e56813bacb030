//! HAL deployment agent CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

mod commands;

#[derive(Parser)]
#[command(name = "hal")]
#[command(about = "HAL build and deployment agent", long_about = None)]
struct Cli {
    /// Agent configuration file
    #[arg(long, global = true, env = "HAL_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single job in this process
    Runner {
        #[command(subcommand)]
        command: RunnerCommands,
    },
    /// Launch runners for queued jobs
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Check the health of a deployment service
    Health {
        #[command(subcommand)]
        command: HealthCommands,
    },
    /// Validate the agent configuration
    Validate {
        /// Also validate a repository `.hal9000.yml`
        #[arg(long)]
        job: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RunnerCommands {
    /// Build a waiting build
    Build {
        /// Build ID
        id: String,
    },
    /// Deploy a waiting push
    Deploy {
        /// Push ID
        id: String,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Start a runner for every waiting push
    Deploy,
}

#[derive(Subcommand)]
enum HealthCommands {
    /// CodeDeploy deployment health
    Codedeploy {
        /// Application name
        application: String,
        /// Deployment group
        group: String,
        /// Check this deployment instead of the latest one
        #[arg(long)]
        deployment: Option<String>,
    },
    /// Elastic Beanstalk environment health
    Beanstalk {
        /// Application name
        application: String,
        /// Environment name or ID
        environment: String,
    },
}

/// Log subscriber writing JSON lines when `json` is set.
fn subscriber<W>(json: bool, writer: W) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer);
    if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing::subscriber::set_global_default(subscriber(cli.json, std::io::stderr))?;
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Runner { command } => {
            let code = match command {
                RunnerCommands::Build { id } => commands::runner::build(config, &id, cli.json).await?,
                RunnerCommands::Deploy { id } => commands::runner::deploy(config, &id, cli.json).await?,
            };
            std::process::exit(code);
        }
        Commands::Worker { command } => match command {
            WorkerCommands::Deploy => {
                commands::worker::deploy(config, cli.config, cli.json).await?;
            }
        },
        Commands::Health { command } => match command {
            HealthCommands::Codedeploy {
                application,
                group,
                deployment,
            } => {
                commands::health::codedeploy(config, &application, &group, deployment, cli.json).await?;
            }
            HealthCommands::Beanstalk {
                application,
                environment,
            } => {
                commands::health::beanstalk(config, &application, &environment, cli.json).await?;
            }
        },
        Commands::Validate { job } => {
            commands::validate(&config, job.as_deref())?;
        }
    }

    Ok(())
}
