use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;

use agent_jobs::cli::Console;
use agent_jobs::config::{ExecutorKind, JobsConfig};
use agent_jobs::executor::{ChatExecutorFactory, DryRunFactory, ExecutorFactory};
use agent_jobs::worker::JobManager;
use agent_jobs::workflow::InMemoryWorkflows;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = JobsConfig::from_env().context("invalid configuration")?;

    // Diagnostics go to a rolling file so they don't interleave with the console.
    std::fs::create_dir_all(&config.logging.dir).with_context(|| {
        format!("failed to create log dir {}", config.logging.dir.display())
    })?;
    let file_appender =
        tracing_appender::rolling::daily(&config.logging.dir, &config.logging.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let workflows = Arc::new(InMemoryWorkflows::from_config(&config)?);

    let executors: Arc<dyn ExecutorFactory> = match config.executor.kind {
        ExecutorKind::Chat => Arc::new(ChatExecutorFactory::new(config.executor.clone())),
        ExecutorKind::DryRun => Arc::new(DryRunFactory),
    };

    eprintln!("Agent Jobs v{}", env!("CARGO_PKG_VERSION"));
    match config.executor.kind {
        ExecutorKind::Chat => {
            eprintln!("   Executor: chat (model: {})", config.executor.model);
            match &config.executor.tools {
                Some(tools) => eprintln!("   Tools: {}", tools.display()),
                None => eprintln!("   Tools: none"),
            }
            if config.executor.api_key.is_none() {
                eprintln!("   Warning: OPENAI_API_KEY not set, jobs will fail at setup");
            }
        }
        ExecutorKind::DryRun => eprintln!("   Executor: dry-run"),
    }
    eprintln!("   Logs: {}", config.logging.dir.display());

    tracing::info!(executor = ?config.executor.kind, "Starting agent-jobs");

    let manager = Arc::new(JobManager::new(executors));
    let console = Console::new(
        Arc::clone(&manager),
        workflows,
        BufReader::new(tokio::io::stdin()),
        std::io::stdout(),
    );

    tokio::select! {
        res = console.run() => {
            res.context("console I/O failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nForce quit, cancelling running jobs...");
            manager.shutdown().await;
            tracing::info!("Stopped by signal");
            // The pending stdin read cannot be interrupted, so leave directly.
            drop(guard);
            std::process::exit(130);
        }
    }

    tracing::info!("Stopped");
    Ok(())
}
