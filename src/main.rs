//! Site-Mirror main entry point
//!
//! This is the command-line interface for the Site-Mirror document site backup engine.

use clap::Parser;
use site_mirror::config::{
    load_config_with_hash, load_credentials, load_sites, write_sample_files, Config,
};
use site_mirror::engine::run_mirror;
use site_mirror::output::{load_statistics, print_site_status, print_statistics, run_monitor};
use site_mirror::storage::{metrics, open_storage, SessionStatus, SqliteStorage, Storage};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Site-Mirror: a resumable mirror of remote document sites
///
/// Site-Mirror enumerates every document library of the listed sites and downloads their files
/// with a pool of workers. Progress lives in an SQLite database, so an interrupted run picks up
/// where it stopped.
#[derive(Parser, Debug)]
#[command(name = "site-mirror")]
#[command(version = "1.0.0")]
#[command(about = "A resumable mirror of remote document sites", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Show the status of every site, or of one site, and exit
    #[arg(long, value_name = "SITE")]
    status: Option<Option<String>>,

    /// Clear the records of one site so that the next run rediscovers it
    #[arg(long, value_name = "SITE")]
    reset_site: Option<String>,

    /// Show statistics from the database and exit
    #[arg(long)]
    stats: bool,

    /// Recalculate statistics from the download records and exit
    #[arg(long)]
    fix_stats: bool,

    /// Show a live progress dashboard until Ctrl+C
    #[arg(long)]
    monitor: bool,

    /// Dashboard refresh interval in seconds
    #[arg(
        long,
        value_name = "SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    interval: u64,

    /// Write sample configuration, site list and credentials files and exit
    #[arg(long)]
    create_config: bool,

    /// Validate config, site list and credentials without downloading anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.create_config {
        for path in write_sample_files(Path::new("."))? {
            println!("Created {}", path.display());
        }
        println!("\nRename the samples, fill in your credentials and run site-mirror again.");
        return Ok(());
    }

    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {}",
                cli.config.display(),
                e
            );
            eprintln!("Run with --create-config to write sample files.");
            return Err(e.into());
        }
    };

    // Setup logging based on verbosity and config
    setup_logging(&cli, &config)?;
    tracing::info!(
        "Configuration loaded from {} (hash: {})",
        cli.config.display(),
        config_hash
    );

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config)?;
    } else if let Some(site) = &cli.status {
        handle_status(&config, site.as_deref())?;
    } else if let Some(site) = &cli.reset_site {
        handle_reset_site(&config, site)?;
    } else if cli.stats {
        handle_stats(&config)?;
    } else if cli.fix_stats {
        handle_fix_stats(&config)?;
    } else if cli.monitor {
        handle_monitor(&config, Duration::from_secs(cli.interval)).await?;
    } else {
        handle_mirror(config, config_hash).await?;
    }

    Ok(())
}

/// Sets up console and file logging
///
/// Everything goes to the console and to `site_mirror_<ts>.log`; events with the `failed_files`
/// target are also written to `site_mirror_failed_files_<ts>.log`.
fn setup_logging(cli: &Cli, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose >= 2 {
        "trace"
    } else if cli.verbose == 1 || cli.debug || config.logging.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let directive = format!("site_mirror={},warn", level);

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let main_log = File::create(log_dir.join(format!("site_mirror_{}.log", timestamp)))?;
    let failed_log = File::create(log_dir.join(format!(
        "site_mirror_failed_files_{}.log",
        timestamp
    )))?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(&directive));
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(main_log))
        .with_filter(EnvFilter::new(&directive));
    let failed_files = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(failed_log))
        .with_filter(filter_fn(|metadata| metadata.target() == "failed_files"));

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(failed_files)
        .init();
    Ok(())
}

fn open_database(config: &Config) -> Result<SqliteStorage, Box<dyn std::error::Error>> {
    let path = config.database_path();
    if !path.exists() {
        return Err(format!("No progress database at {}", path.display()).into());
    }
    Ok(open_storage(&path, config.engine.max_retry)?)
}

/// Handles the --dry-run mode: validates inputs and shows what would be mirrored
fn handle_dry_run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let sites = load_sites(Path::new(&config.paths.sites_csv))?;
    let credentials = load_credentials(Path::new(&config.paths.credentials_path))?;

    println!("=== Site-Mirror Dry Run ===\n");

    println!("Engine Configuration:");
    println!("  Workers: {}", config.engine.num_threads);
    println!("  Max retry: {}", config.engine.max_retry);
    println!("  Batch size: {}", config.engine.batch_size);
    println!(
        "  Files per credential session: {}",
        config.engine.max_files_per_session
    );
    println!("  API retry delay: {}s", config.engine.api_retry_delay);
    println!(
        "  Token refresh interval: {}s",
        config.engine.token_refresh_interval
    );

    println!("\nPaths:");
    println!("  Output: {}", config.output_dir().display());
    println!("  Database: {}", config.database_path().display());
    println!("  Logs: {}", config.log_dir().display());
    println!("  Backups: {}", config.backup_dir().display());

    println!("\nCredentials:");
    println!("  Tenant: {}", credentials.tenant_id);
    println!("  Client: {}", credentials.client_id);

    println!("\nSites ({}):", sites.len());
    for site in &sites {
        println!("  - {} ({})", site.name, site.url);
    }

    println!("\n✓ Configuration is valid");
    println!("✓ Would mirror {} sites", sites.len());
    Ok(())
}

/// Handles the --status mode
fn handle_status(config: &Config, site: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_database(config)?;
    let sites = storage.get_site_status(site)?;
    print_site_status(&sites);
    Ok(())
}

/// Handles the --reset-site mode
fn handle_reset_site(config: &Config, site: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_database(config)?;
    let removed = storage.reset_site(site)?;
    tracing::info!("Reset site {}: {} download records removed", site, removed);
    println!(
        "✓ Site {} reset ({} download records removed); it will be rediscovered on the next run",
        site, removed
    );
    Ok(())
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Database: {}\n", config.database_path().display());
    let storage = open_database(config)?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);
    Ok(())
}

/// Handles the --fix-stats mode
fn handle_fix_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_database(config)?;
    let before = storage.snapshot_statistics()?;
    let after = storage.rebuild_statistics()?;

    println!("=== Statistics Rebuilt ===\n");
    for name in metrics::ALL {
        let (old, new) = (before.get(name), after.get(name));
        if (old - new).abs() > f64::EPSILON {
            println!("  {}: {} -> {}", name, old, new);
        } else {
            println!("  {}: {}", name, new);
        }
    }
    Ok(())
}

/// Handles the --monitor mode
async fn handle_monitor(
    config: &Config,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = open_database(config)?;
    run_monitor(&storage, interval).await?;
    Ok(())
}

/// Handles the main mirror operation
async fn handle_mirror(
    config: Config,
    config_hash: String,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        "Mirroring into {} with {} workers",
        config.output_dir().display(),
        config.engine.num_threads
    );

    match run_mirror(config, config_hash).await {
        Ok(summary) => {
            match summary.status {
                SessionStatus::Interrupted => tracing::warn!(
                    "Mirror interrupted; run again to resume (session {})",
                    summary.session_id
                ),
                _ => tracing::info!("Mirror completed (session {})", summary.session_id),
            }
            tracing::info!(
                "Totals: {} of {} files downloaded, {} failed, {} MB",
                summary.statistics.get(metrics::SUCCESSFUL_DOWNLOADS),
                summary.statistics.get(metrics::TOTAL_FILES),
                summary.statistics.get(metrics::FAILED_DOWNLOADS),
                summary.statistics.get(metrics::MB_DOWNLOADED).round()
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Mirror failed: {}", e);
            Err(e.into())
        }
    }
}
