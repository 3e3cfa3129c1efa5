//! Serve command - run the queue service

use crate::cli::style::{Stylize, check};
use anstream::println;
use mergeq::api::{AppState, router};
use mergeq::checks::CheckAggregator;
use mergeq::config::Config;
use mergeq::conflicts::ConflictResolver;
use mergeq::driver::{DriverSettings, MergeQueue};
use mergeq::error::Result;
use mergeq::events::EventRegistry;
use mergeq::platform::create_change_request_service;
use mergeq::queue::{QueueStore, storage};
use mergeq::workspace::{GitCli, GitWorkspace, RepoLocks};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How often stuck merges and dead subscribers are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the serve command
pub async fn run_serve(config: Config, listen: Option<String>) -> Result<()> {
    if config.repositories.is_empty() {
        warn!("no repositories configured, the queue will reject every request");
    }
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&config.workspace_root)?;

    let queue = Arc::new(build_queue(&config).await?);

    let sweeper = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match queue.sweep().await {
                    Ok(report) if !report.timed_out.is_empty() || report.subscribers > 0 => {
                        info!(timed_out = report.timed_out.len(), subscribers = report.subscribers, "sweep");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sweep failed"),
                }
            }
        })
    };

    let addr = listen.unwrap_or_else(|| config.listen.clone());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, repositories = config.repositories.len(), "queue service listening");
    println!(
        "{} Serving {} repositor{} on {}",
        check().success(),
        config.repositories.len(),
        if config.repositories.len() == 1 { "y" } else { "ies" },
        addr.accent()
    );

    let served = axum::serve(listener, router(AppState::new(queue)))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    sweeper.abort();
    served?;

    println!("{}", "Stopped".muted());
    Ok(())
}

/// Assemble the engine from the configuration and persisted state
async fn build_queue(config: &Config) -> Result<MergeQueue> {
    let workspace: Arc<dyn GitWorkspace> = Arc::new(GitCli::new(
        &config.workspace_root,
        &config.remote_url,
        &config.committer.name,
        &config.committer.email,
    ));
    let locks = Arc::new(RepoLocks::new(config.acquire_timeout()));
    let conflicts = ConflictResolver::new(workspace, locks, &config.remote);
    let platform = create_change_request_service(config).await?;

    let (store, interrupted) = QueueStore::load(&config.state_dir)?;
    let checks = CheckAggregator::from_snapshot(storage::load_checks(&config.state_dir)?);
    if !interrupted.is_empty() {
        warn!(entries = interrupted.len(), "merges interrupted by restart were failed");
    }

    let queue = MergeQueue::new(
        store,
        checks,
        conflicts,
        platform,
        EventRegistry::new(),
        DriverSettings::from_config(config),
    );
    queue.recover(&interrupted).await;
    Ok(queue)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
