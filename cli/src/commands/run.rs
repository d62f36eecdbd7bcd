//! `yggdrasil run`: start the dispatcher loop, and its metrics listener if
//! `observability.enable_metrics` is set, until SIGTERM/SIGINT.

use std::path::PathBuf;

use colored::Colorize;
use tracing::info;

use yggdrasil_core::config::ConfigLoader;
use yggdrasil_core::dispatcher::Dispatcher;
use yggdrasil_core::observability::EventBus;

use crate::error::CliError;

pub struct RunArgs {
    pub config: Option<PathBuf>,
}

/// Race SIGTERM and SIGINT; resolves on whichever arrives first.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("installing ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

pub async fn execute(args: RunArgs, _verbose: bool) -> Result<(), CliError> {
    let config = match args.config {
        Some(path) => ConfigLoader::new().with_file(path).load(),
        None => ConfigLoader::new().load(),
    }?;

    let events = std::sync::Arc::new(EventBus::new());
    let dispatcher = Dispatcher::from_config(&config, events.clone()).map_err(CliError::LedgerUnavailable)?;

    let metrics_server = dispatcher.metrics().map(|metrics| {
        let port = config.observability.metrics_port;
        tokio::spawn(async move {
            let app = yggdrasil_core::observability::metrics::router(metrics);
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            info!(%addr, "serving metrics");
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(err) = axum::serve(listener, app).await {
                        tracing::error!(%err, "metrics server exited");
                    }
                }
                Err(err) => tracing::error!(%err, %addr, "failed to bind metrics listener"),
            }
        })
    });

    println!(
        "{} dispatcher starting ({} host(s), poll every {}s)",
        "▶".bright_blue().bold(),
        config.hosts.len(),
        config.poll_interval_seconds
    );

    let summary = dispatcher.run(Box::pin(shutdown_signal())).await;

    if let Some(handle) = metrics_server {
        handle.abort();
    }

    if summary.blocked_on_shutdown > 0 {
        println!(
            "{} shutdown complete; {} in-flight task(s) were blocked",
            "⚠".yellow().bold(),
            summary.blocked_on_shutdown
        );
    } else {
        println!("{} shutdown complete", "✓".green().bold());
    }

    Ok(())
}
