use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

mod config;
mod core_flows;
mod render;

use crate::core_flows::{
    error_exit_code, run_check_command, run_env_command, run_exec_command, run_install_command,
    run_lock_command, run_update_command, Project,
};
use crate::render::{current_output_style, render_status_line};

const LOG_ENV_VAR: &str = "LOCKSTEP_LOG";

#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(about = "Reproducible, locked package sets per project", long_about = None)]
struct Cli {
    /// Manifest to use instead of searching upward from the current directory.
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve when needed, write the lock and install every active package.
    Install {
        /// Groups to leave off the disk; remembered for later commands.
        #[arg(long, value_delimiter = ',')]
        without: Option<Vec<String>>,
        /// Install root for this project; remembered for later commands.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Re-resolve the named packages (or everything) and install the result.
    Update {
        names: Vec<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Resolve and write the lock without installing.
    Lock,
    /// Exit 0 when the lock is current and every active package is installed.
    Check,
    /// Run a command with only the locked packages visible.
    Exec {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the activated environment as shell assignments.
    Env,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "err", &format!("{err:#}"))
            );
            error_exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run_cli(cli: Cli) -> Result<i32> {
    let mut project = Project::discover(cli.manifest.as_deref())?;

    match cli.command {
        Commands::Install { without, path } => {
            run_install_command(&mut project, without, path)?;
            Ok(0)
        }
        Commands::Update { names, sources } => {
            run_update_command(&project, names, sources)?;
            Ok(0)
        }
        Commands::Lock => {
            run_lock_command(&project)?;
            Ok(0)
        }
        Commands::Check => run_check_command(&project),
        Commands::Exec { command, args } => run_exec_command(&project, &command, &args),
        Commands::Env => {
            run_env_command(&project)?;
            Ok(0)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
