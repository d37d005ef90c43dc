//! Catalog re-snapshot: seeds or refreshes price history for every stored listing.

use std::sync::Arc;

use anyhow::{Context, Result};
use dealhub_core::{Clock, PriceSnapshot};
use dealhub_storage::store::price_changed;
use dealhub_storage::ListingStore;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub page_size: usize,
    pub lookup_chunk: usize,
    pub insert_batch: usize,
    pub dry_run: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            lookup_chunk: 200,
            insert_batch: 500,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub listings: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub dry_run: bool,
}

pub async fn snapshot_catalog(
    store: &dyn ListingStore,
    clock: Arc<dyn Clock>,
    options: SnapshotOptions,
) -> Result<SnapshotReport> {
    let page_size = options.page_size.max(1);
    let lookup_chunk = options.lookup_chunk.max(1);
    let insert_batch = options.insert_batch.max(1);
    let mut report = SnapshotReport {
        dry_run: options.dry_run,
        ..SnapshotReport::default()
    };
    let mut pending: Vec<PriceSnapshot> = Vec::new();
    let mut after = None;

    loop {
        let page = store
            .page(after, page_size)
            .await
            .context("paging listings")?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id);
        report.listings += page.len();

        for chunk in page.chunks(lookup_chunk) {
            let ids = chunk.iter().map(|l| l.id).collect::<Vec<_>>();
            let latest = store
                .latest_snapshot_prices(&ids)
                .await
                .context("loading latest snapshot prices")?;
            let captured_at = clock.now();
            for listing in chunk {
                match latest.get(&listing.id) {
                    Some(&previous) if !price_changed(previous, listing.price) => report.unchanged += 1,
                    previous => pending.push(PriceSnapshot::new(
                        listing.id,
                        listing.price,
                        previous.copied(),
                        captured_at,
                    )),
                }
            }
        }

        while pending.len() >= insert_batch {
            let batch = pending.drain(..insert_batch).collect::<Vec<_>>();
            flush(store, &batch, options.dry_run, &mut report).await;
        }

        if page.len() < page_size {
            break;
        }
    }

    if !pending.is_empty() {
        flush(store, &pending, options.dry_run, &mut report).await;
    }

    info!(
        listings = report.listings,
        inserted = report.inserted,
        unchanged = report.unchanged,
        failed = report.failed,
        dry_run = report.dry_run,
        "catalog snapshot finished"
    );
    Ok(report)
}

/// A failed batch is counted and skipped; the rest of the catalog still runs.
async fn flush(store: &dyn ListingStore, batch: &[PriceSnapshot], dry_run: bool, report: &mut SnapshotReport) {
    if dry_run {
        report.inserted += batch.len();
        return;
    }
    match store.insert_snapshots(batch).await {
        Ok(n) => report.inserted += n,
        Err(err) => {
            warn!(batch = batch.len(), error = %err, "snapshot batch insert failed");
            report.failed += batch.len();
        }
    }
}
