//! Mirror engine
//!
//! This module contains the synchronization engine, including:
//! - Credential session management with coalesced refreshes
//! - Site discovery through the content source
//! - The download worker pool with retry and backoff
//! - Site completion tracking and statistics aggregation
//! - Overall run coordination

mod coordinator;
mod discovery;
mod monitor;
mod session;
mod stats;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{Engine, RunSummary, BACKUPS_KEPT};
pub use discovery::{destination_path, safe_path_component, DiscoverySummary, SiteDiscovery};
pub use monitor::SiteCompletionMonitor;
pub use session::SessionManager;
pub use stats::{StatEvent, StatisticsAggregator};
pub use worker::{partial_path, PoolBackoff};

use crate::config::{load_credentials, load_sites, Config};
use crate::source::GraphContentSource;
use crate::storage::open_storage;
use crate::MirrorError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Runs a complete mirror with the Microsoft Graph content source
///
/// Loads the site list and credentials named by `config`, opens the progress database and runs
/// the engine until every site is terminal or Ctrl-C is pressed.
pub async fn run_mirror(config: Config, config_hash: String) -> Result<RunSummary, MirrorError> {
    let sites = load_sites(Path::new(&config.paths.sites_csv))?;
    let credentials = load_credentials(Path::new(&config.paths.credentials_path))?;
    tracing::info!("Loaded {} sites from {}", sites.len(), config.paths.sites_csv);

    let storage = open_storage(&config.database_path(), config.engine.max_retry)?;
    let source = GraphContentSource::new(&config.source.graph_url, &config.source.authority_url)?
        .with_stall_timeout(Duration::from_secs(config.source.stall_timeout));

    let engine = Engine::new(
        config,
        Arc::new(storage),
        Arc::new(source),
        credentials,
        config_hash,
    );

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight work and shutting down");
            shutdown.cancel();
        }
    });

    engine.run(&sites).await
}
