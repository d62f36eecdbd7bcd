use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;
mod error;
mod output;

use commands::{config, ledger, run};
use error::CliError;

/// Yggdrasil - homelab task dispatcher
#[derive(Parser)]
#[command(name = "yggdrasil")]
#[command(author = "Yggdrasil Dispatcher Contributors")]
#[command(version)]
#[command(about = "Distributed task dispatcher for a homelab automation system", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an explicit config file, overriding the standard search
    /// order (`YGGDRASIL_CONFIG`, `YGGDRASIL_ENV`, platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output, including full error cause chains.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher loop.
    Run,

    /// Inspect and manage the ledger directly (bypasses the dispatcher).
    #[command(subcommand)]
    Ledger(ledger::LedgerCommands),

    /// Configuration management commands.
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Generate shell completions.
    Completions {
        /// The shell to generate completions for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(env_filter()).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(env_filter()).init(),
    }

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = dispatch(cli.command, cli.config, cli.verbose).await;

    if let Err(err) = result {
        err.print(cli.verbose);
        process::exit(err.exit_code());
    }
}

async fn dispatch(command: Commands, config: Option<PathBuf>, verbose: bool) -> Result<(), CliError> {
    match command {
        Commands::Run => run::execute(run::RunArgs { config }, verbose).await,
        Commands::Ledger(cmd) => ledger::execute(cmd, config, verbose).await.map_err(CliError::Other),
        Commands::Config(cmd) => config::execute(cmd, config, verbose).await.map_err(CliError::Other),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
