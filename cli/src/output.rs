//! Output formatting for the `ledger` and `config` commands.
//!
//! - Pretty: human-readable, colored, for a terminal.
//! - Json / JsonPretty: machine-readable, for piping to `jq`.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use std::collections::HashMap;
use yggdrasil_core::prelude::{AuditEntry, Task};

/// Output format options shared by every inspection command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable, colored table/listing.
    #[default]
    Pretty,
    /// Compact JSON.
    Json,
    /// Pretty-printed JSON.
    JsonPretty,
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

/// Display one task's detail view (`ledger show`).
pub fn display_task(task: &Task, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(task, false),
        OutputFormat::JsonPretty => print_json(task, true),
        OutputFormat::Pretty => {
            println!();
            println!("{} {}", "Task".bright_blue().bold(), task.id.dimmed());
            println!("{}", "─".repeat(60).dimmed());
            println!("{} {}", "Status:".bright_cyan(), colorize_status(task.status.as_str()));
            println!("{} {}", "Type:".bright_cyan(), task.task_type);
            println!("{} {}", "Priority:".bright_cyan(), task.priority);
            println!("{} {}", "Attempts:".bright_cyan(), task.attempt_count);
            if !task.title.is_empty() {
                println!("{} {}", "Title:".bright_cyan(), task.title);
            }
            if !task.labels.is_empty() {
                println!("{} {}", "Labels:".bright_cyan(), task.labels.iter().cloned().collect::<Vec<_>>().join(", "));
            }
            if !task.dependencies.is_empty() {
                println!(
                    "{} {}",
                    "Depends on:".bright_cyan(),
                    task.dependencies.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            println!("{} {}", "Created:".bright_cyan(), task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("{} {}", "Updated:".bright_cyan(), task.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if let Some(result) = &task.result {
                println!("{}\n{}", "Result:".green().bold(), result);
            }
            if let Some(error) = &task.error {
                println!("{}\n{}", "Error:".red().bold(), error);
            }
            println!();
            Ok(())
        }
    }
}

/// Display a listing of tasks (`ledger list`).
pub fn display_task_list(tasks: &[Task], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(tasks, false),
        OutputFormat::JsonPretty => print_json(tasks, true),
        OutputFormat::Pretty => {
            if tasks.is_empty() {
                println!("{}", "No tasks in the ledger.".dimmed());
                return Ok(());
            }
            println!(
                "{:<20} {:<12} {:<20} {:<5} {:<4}",
                "ID".bold(),
                "STATUS".bold(),
                "TYPE".bold(),
                "PRI".bold(),
                "ATT".bold(),
            );
            for task in tasks {
                println!(
                    "{:<20} {:<12} {:<20} {:<5} {:<4}",
                    task.id,
                    colorize_status(task.status.as_str()),
                    task.task_type,
                    task.priority,
                    task.attempt_count,
                );
            }
            Ok(())
        }
    }
}

/// Display a task's audit trail (`ledger audit`).
pub fn display_audit_trail(entries: &[AuditEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(entries, false),
        OutputFormat::JsonPretty => print_json(entries, true),
        OutputFormat::Pretty => {
            if entries.is_empty() {
                println!("{}", "No audit entries.".dimmed());
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{} {} {} {} {} (attempt {})",
                    entry.ts.format("%Y-%m-%d %H:%M:%S"),
                    colorize_status(entry.old_status.as_str()),
                    "->".dimmed(),
                    colorize_status(entry.new_status.as_str()),
                    entry.message.as_deref().unwrap_or("").dimmed(),
                    entry.attempt,
                );
            }
            Ok(())
        }
    }
}

/// Display aggregate status counts (`ledger stats`).
pub fn display_stats(stats: &HashMap<String, u64>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(stats, false),
        OutputFormat::JsonPretty => print_json(stats, true),
        OutputFormat::Pretty => {
            println!("{}", "Ledger status counts".bright_blue().bold());
            for status in ["open", "in_progress", "closed", "blocked", "cancelled"] {
                let count = stats.get(status).copied().unwrap_or(0);
                println!("  {:<12} {}", colorize_status(status), count);
            }
            Ok(())
        }
    }
}

fn colorize_status(status: &str) -> ColoredString {
    match status {
        "open" => status.yellow(),
        "in_progress" => status.bright_blue(),
        "closed" => status.green(),
        "blocked" => status.red(),
        "cancelled" => status.dimmed(),
        other => other.normal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_task() -> Task {
        Task::new("t1", "text-processing", 1, Utc::now())
    }

    #[test]
    fn display_task_json_is_valid() {
        let task = sample_task();
        assert!(display_task(&task, OutputFormat::Json).is_ok());
        assert!(display_task(&task, OutputFormat::JsonPretty).is_ok());
    }

    #[test]
    fn display_task_list_handles_empty() {
        assert!(display_task_list(&[], OutputFormat::Pretty).is_ok());
    }

    #[test]
    fn display_stats_handles_missing_statuses() {
        let stats = HashMap::from([("open".to_string(), 2u64)]);
        assert!(display_stats(&stats, OutputFormat::Pretty).is_ok());
    }
}
