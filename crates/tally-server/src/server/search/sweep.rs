use super::{IndexDocument, SearchIndex};
use crate::common::Result;
use crate::server::store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of a [`ReindexSweep`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    /// Entries read from the durable store.
    pub scanned: u64,
    /// Documents written to the index.
    pub indexed: u64,
    /// Documents removed before the run (full rebuild only).
    pub cleared: u64,
    /// Id of the last entry republished. Pass it to
    /// [`ReindexSweep::resume_after`] to continue an interrupted run.
    pub last_id: i64,
}

/// Republishes every durable entry into the search index.
///
/// Idempotent: documents are upserted by id, so running the sweep twice, or
/// over entries that were indexed on the creation path, leaves one document
/// per entry.
pub struct ReindexSweep {
    store: SqliteStore,
    index: Arc<dyn SearchIndex>,
    batch_size: u32,
}

impl ReindexSweep {
    pub fn new(store: SqliteStore, index: Arc<dyn SearchIndex>, batch_size: u32) -> Self {
        Self {
            store,
            index,
            batch_size: batch_size.max(1),
        }
    }

    /// Republishes all entries.
    pub async fn run(&self) -> Result<ReindexReport> {
        self.resume_after(0).await
    }

    /// Clears the index, then republishes all entries, so documents of
    /// entries that no longer exist are dropped as well.
    pub async fn rebuild(&self) -> Result<ReindexReport> {
        let cleared = self.index.clear().await?;
        let report = self.run().await?;
        Ok(ReindexReport { cleared, ..report })
    }

    /// Republishes entries with `id > after_id`, one page at a time.
    ///
    /// Any error stops the run; the report of an interrupted run is lost, so
    /// progress is logged per page.
    pub async fn resume_after(&self, after_id: i64) -> Result<ReindexReport> {
        let mut report = ReindexReport {
            last_id: after_id,
            ..ReindexReport::default()
        };

        loop {
            let page = self
                .store
                .entries_after(report.last_id, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let last_id = last.id;
            let full_page = page.len() as u32 == self.batch_size;

            report.scanned += page.len() as u64;
            let docs = page.iter().map(IndexDocument::from_entry).collect();
            report.indexed += self.index.upsert_batch(docs).await? as u64;
            report.last_id = last_id;

            tracing::debug!(
                last_id,
                scanned = report.scanned,
                "Reindex sweep page committed"
            );

            if !full_page {
                break;
            }
        }

        tracing::info!(
            scanned = report.scanned,
            indexed = report.indexed,
            last_id = report.last_id,
            "Reindex sweep complete"
        );
        Ok(report)
    }
}
