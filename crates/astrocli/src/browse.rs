//! Scrolls a grid of cells through the catalog, loading photos as they come into view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use astronomy_cache::SerialCache;
use astronomy_service::config::Config;
use astronomy_service::fetch::HttpFetcher;
use astronomy_service::pipeline::{DeliveryReport, FetchPipeline, Presenter};
use tokio::runtime::Handle;

use crate::catalog::Catalog;
use crate::grid::TerminalGrid;

/// Time between two scroll steps, deliveries are processed in between.
const FRAME: Duration = Duration::from_millis(16);

#[derive(Clone, Copy, Debug)]
pub struct BrowseOptions {
    /// Number of cells in the grid.
    pub slots: usize,
    /// Number of catalog entries to advance per scroll step.
    pub step: usize,
}

#[derive(Debug)]
pub struct Outcome {
    pub grid: TerminalGrid,
    pub report: DeliveryReport,
    pub loads: BTreeMap<&'static str, usize>,
    pub cached: usize,
}

/// Scrolls through the entire catalog and waits for the last photos to arrive.
pub async fn browse(config: &Config, catalog: &Catalog, options: BrowseOptions) -> Result<Outcome> {
    let fetcher = HttpFetcher::from_config(config, catalog.locations())
        .context("failed to create HTTP client")?;
    let cache = SerialCache::new("photos").context("failed to start the photo cache")?;
    let mut pipeline =
        FetchPipeline::from_config(config, cache, Arc::new(fetcher), Handle::current());

    let mut grid = TerminalGrid::new(options.slots);
    let mut report = DeliveryReport::default();
    let mut loads = BTreeMap::new();

    let last_offset = catalog.len().saturating_sub(options.slots);
    let mut offsets: Vec<_> = (0..=last_offset).step_by(options.step.max(1)).collect();
    if offsets.last() != Some(&last_offset) {
        offsets.push(last_offset);
    }

    for offset in offsets {
        tracing::debug!(offset, "Scrolling");
        grid.scroll_to(catalog, offset);

        for slot in 0..grid.slots() {
            if grid.current_key(slot).is_none() {
                pipeline.cancel(slot);
            }
            let status = pipeline.load(&mut grid, slot).await;
            *loads.entry(status.as_str()).or_default() += 1;
        }

        tokio::time::sleep(FRAME).await;
        while let Some(delivery) = pipeline.try_next_delivery() {
            report.record(&pipeline.deliver(&mut grid, delivery));
        }
    }

    report.merge(pipeline.run_until_idle(&mut grid).await);
    let cached = pipeline.cache().len_async().await;
    tracing::info!(%report, cached, "Finished browsing");

    Ok(Outcome {
        grid,
        report,
        loads,
        cached,
    })
}
