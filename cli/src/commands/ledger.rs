//! `yggdrasil ledger`: the human inspection/export/import tool. Operates
//! directly against the `rusqlite` store; the dispatcher is not involved.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use colored::Colorize;

use yggdrasil_core::config::ConfigLoader;
use yggdrasil_core::ledger::{export_jsonl, import_jsonl, now, Ledger, SqliteLedger, Task, UpdateFields};

use crate::output::{display_audit_trail, display_stats, display_task, display_task_list, OutputFormat};

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Insert a new `open` task.
    Create {
        /// Stable task ID.
        #[arg(long)]
        id: String,
        /// Handler task type, e.g. `text-processing`.
        #[arg(long = "type")]
        task_type: String,
        /// 0 (critical) through 3, default 2.
        #[arg(long, default_value_t = 2)]
        priority: u8,
        /// Short human label.
        #[arg(long, default_value = "")]
        title: String,
        /// Opaque payload consumed by the handler.
        #[arg(long, default_value = "")]
        description: String,
        /// Comma-separated routing labels.
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        /// Task IDs that must be `closed` before this task is ready.
        #[arg(long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<String>,
        /// Handler-specific structured parameters, as a JSON object.
        #[arg(long)]
        params: Option<String>,
    },

    /// List every task in the ledger.
    List {
        /// Show only tasks in this status.
        #[arg(long)]
        status: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Show one task's full detail.
    Show {
        id: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Show one task's audit trail.
    Audit {
        id: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Show aggregate status counts.
    Stats {
        #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },

    /// Export every task as line-delimited JSON.
    Export {
        /// Destination file; writes to stdout if omitted.
        path: Option<PathBuf>,
    },

    /// Import tasks from a line-delimited JSON file.
    Import {
        /// Source file.
        path: PathBuf,
    },

    /// Requeue a `blocked` task back to `open` for the next poll.
    Requeue {
        id: String,
        /// Note recorded in the audit log for this requeue.
        #[arg(long)]
        message: Option<String>,
    },
}

async fn open_ledger(config: Option<PathBuf>) -> Result<SqliteLedger> {
    let loaded = match config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::new().load(),
    }
    .context("loading configuration")?;
    SqliteLedger::open(&loaded.ledger_path).with_context(|| format!("opening ledger at {}", loaded.ledger_path.display()))
}

pub async fn execute(cmd: LedgerCommands, config: Option<PathBuf>, _verbose: bool) -> Result<()> {
    match cmd {
        LedgerCommands::Create {
            id,
            task_type,
            priority,
            title,
            description,
            labels,
            depends_on,
            params,
        } => create(config, id, task_type, priority, title, description, labels, depends_on, params).await,
        LedgerCommands::List { status, format } => list(config, status, format).await,
        LedgerCommands::Show { id, format } => show(config, id, format).await,
        LedgerCommands::Audit { id, format } => audit(config, id, format).await,
        LedgerCommands::Stats { format } => stats(config, format).await,
        LedgerCommands::Export { path } => export(config, path).await,
        LedgerCommands::Import { path } => import(config, path).await,
        LedgerCommands::Requeue { id, message } => requeue(config, id, message).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn create(
    config: Option<PathBuf>,
    id: String,
    task_type: String,
    priority: u8,
    title: String,
    description: String,
    labels: Vec<String>,
    depends_on: Vec<String>,
    params: Option<String>,
) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let mut task = Task::new(&id, &task_type, priority, now());
    task.title = title;
    task.description = description;
    task.labels = labels.into_iter().collect::<BTreeSet<_>>();
    task.dependencies = depends_on.into_iter().collect::<BTreeSet<_>>();
    if let Some(raw) = params {
        task.params = serde_json::from_str(&raw).context("parsing --params as JSON")?;
    }
    ledger.create(task).await.context("creating task")?;
    println!("{} created task {}", "✓".green().bold(), id);
    Ok(())
}

async fn list(config: Option<PathBuf>, status: Option<String>, format: OutputFormat) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let mut tasks = ledger.list_all().await.context("listing tasks")?;
    if let Some(status) = status {
        tasks.retain(|t| t.status.as_str() == status);
    }
    display_task_list(&tasks, format)
}

async fn show(config: Option<PathBuf>, id: String, format: OutputFormat) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let task = ledger.get(&id).await.context("fetching task")?;
    display_task(&task, format)
}

async fn audit(config: Option<PathBuf>, id: String, format: OutputFormat) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let entries = ledger.audit(&id).await.context("fetching audit trail")?;
    display_audit_trail(&entries, format)
}

async fn stats(config: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let stats = ledger.stats().await.context("computing stats")?;
    display_stats(&stats, format)
}

async fn export(config: Option<PathBuf>, path: Option<PathBuf>) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let count = match &path {
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
            export_jsonl(&ledger, file).await.context("exporting ledger")?
        }
        None => export_jsonl(&ledger, std::io::stdout()).await.context("exporting ledger")?,
    };
    if path.is_some() {
        eprintln!("{} exported {} task(s)", "✓".green().bold(), count);
    }
    Ok(())
}

async fn import(config: Option<PathBuf>, path: PathBuf) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let file = std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let count = import_jsonl(&ledger, reader).await.context("importing ledger")?;
    println!("{} imported {} task(s)", "✓".green().bold(), count);
    Ok(())
}

async fn requeue(config: Option<PathBuf>, id: String, message: Option<String>) -> Result<()> {
    let ledger = open_ledger(config).await?;
    ledger
        .update(
            &id,
            yggdrasil_core::ledger::Status::Open,
            UpdateFields {
                message: Some(message.unwrap_or_else(|| "requeued by operator".to_string())),
                ..Default::default()
            },
        )
        .await
        .context("requeuing task")?;
    println!("{} requeued task {} to open (as of {})", "✓".green().bold(), id, Utc::now().format("%H:%M:%S"));
    Ok(())
}
