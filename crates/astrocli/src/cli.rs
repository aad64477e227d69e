//! Exposes the command line application.
use std::path::PathBuf;

use anyhow::{Context, Result};
use astronomy_service::config::Config;
use astronomy_service::{logging, metrics};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::browse::{self, BrowseOptions};
use crate::catalog::Catalog;
use crate::output;

/// Scrolls a grid of reusable cells through a catalog of rover photos.
///
/// Every cell that comes into view loads its photo through the shared cache. Photos that
/// arrive after their cell has moved on are discarded. At the end, the final grid and the
/// delivery statistics are printed.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The photo catalog, in the format of the rover photo manifest.
    #[arg(long, value_name = "FILE")]
    catalog: PathBuf,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The number of cells in the grid.
    #[arg(long, default_value_t = 6)]
    slots: usize,

    /// The number of photos to scroll per step.
    #[arg(long, default_value_t = 3)]
    step: usize,

    /// The severity level of logging output.
    ///
    /// Overrides the level from the configuration file. Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<LevelFilter>,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let catalog = Catalog::from_path(&cli.catalog)?;
    if catalog.is_empty() {
        tracing::warn!("The catalog contains no photos");
    } else {
        tracing::info!("Loaded {} photos from the catalog", catalog.len());
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.thread_name("astronomy-fetch").enable_all();
    if let Some(threads) = config.worker_threads {
        runtime.worker_threads(threads);
    }
    let runtime = runtime.build().context("failed to start the fetch runtime")?;

    let options = BrowseOptions {
        slots: cli.slots,
        step: cli.step,
    };
    let outcome = runtime.block_on(browse::browse(&config, &catalog, options))?;
    output::print_outcome(&catalog, &outcome);

    Ok(())
}
