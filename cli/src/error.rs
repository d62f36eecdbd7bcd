use colored::Colorize;
use thiserror::Error;

/// CLI-level errors that carry their own process exit code, distinct from
/// the `anyhow::Error` chains individual commands propagate internally.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(#[from] yggdrasil_core::config::ConfigError),

    /// The ledger database could not be opened.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(yggdrasil_core::error::DispatchError),

    /// Anything else: a dispatch error surfaced from a `ledger` subcommand,
    /// an I/O failure, or a malformed JSONL record.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        use yggdrasil_core::error::exit_codes;
        match self {
            Self::Config(_) => exit_codes::CONFIG_INVALID,
            Self::LedgerUnavailable(_) => exit_codes::FATAL_IO,
            Self::Other(_) => exit_codes::UNEXPECTED,
        }
    }

    /// Print the error (and, in verbose mode, its full cause chain) to
    /// stderr.
    pub fn print(&self, verbose: bool) {
        eprintln!("{} {}", "Error:".red().bold(), self);
        if verbose {
            if let Self::Other(err) = self {
                for cause in err.chain().skip(1) {
                    eprintln!("  {} {}", "caused by:".dimmed(), cause);
                }
            }
        }
    }
}
