mod agent_cmds;
mod config;
mod run_cmd;
mod workspace_cmds;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use yardstick_core::workspace::WorkspaceManager;

use config::YardstickConfig;

#[derive(Parser)]
#[command(name = "yardstick", about = "Evaluation harness for LLM coding agents")]
struct Cli {
    /// Workspace root (overrides YARDSTICK_WORKSPACE_ROOT env var)
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent on a task and evaluate the result
    Run {
        /// Run configuration file (TOML, or JSON with a .json extension)
        #[arg(long, short)]
        config: PathBuf,
        /// Also write results.json to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check a run configuration without running it
    Validate {
        /// Run configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// List run workspaces
    List,
    /// Delete a run workspace
    Clean {
        /// Run id or workspace path
        target: Option<String>,
        /// Delete every workspace not locked by a running process
        #[arg(long)]
        all: bool,
    },
    /// Check whether an agent adapter is installed and usable
    CheckAgent {
        /// Adapter name (claude-code, command)
        adapter: String,
        /// Adapter configuration as a JSON object
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            let resolved = YardstickConfig::resolve(cli.workspace_root.as_deref())?;
            let code = run_cmd::run_command(&config, output.as_deref(), &resolved).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Validate { config } => {
            agent_cmds::run_validate(&config)?;
        }
        Commands::List => {
            let resolved = YardstickConfig::resolve(cli.workspace_root.as_deref())?;
            workspace_cmds::run_list(&WorkspaceManager::new(resolved.workspace_root))?;
        }
        Commands::Clean { target, all } => {
            let resolved = YardstickConfig::resolve(cli.workspace_root.as_deref())?;
            workspace_cmds::run_clean(
                &WorkspaceManager::new(resolved.workspace_root),
                target.as_deref(),
                all,
            )?;
        }
        Commands::CheckAgent { adapter, config } => {
            if !agent_cmds::run_check_agent(&adapter, config.as_deref()).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
