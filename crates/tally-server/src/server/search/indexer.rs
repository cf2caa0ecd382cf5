use super::{IndexDocument, SearchIndex};
use crate::common::{Error, types::Entry};
use crate::server::telemetry::increment_index_failures;
use core::time::Duration;
use std::sync::Arc;
use tokio::time::timeout;

/// Failure boundary between creation workers and the search index.
///
/// [`Indexer::index_entry`] never fails: an index that errors or does not
/// answer within the budget is logged as an [`Error::IndexingFailure`] and
/// the creation is still reported successful. Missed documents are restored
/// by the reindex sweep.
#[derive(Clone)]
pub struct Indexer {
    index: Arc<dyn SearchIndex>,
    timeout: Duration,
}

impl Indexer {
    pub fn new(index: Arc<dyn SearchIndex>, timeout: Duration) -> Self {
        Self { index, timeout }
    }

    /// Projects `entry` into the index. Returns whether the write landed.
    pub async fn index_entry(&self, entry: &Entry) -> bool {
        let doc = IndexDocument::from_entry(entry);
        let reason = match timeout(self.timeout, self.index.upsert(doc)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {:?}", self.timeout),
        };

        let err = Error::IndexingFailure {
            entry_id: entry.id,
            reason,
        };
        tracing::warn!(
            entry_id = entry.id,
            thread_id = entry.parent_id,
            "{err}; the reindex sweep will restore it"
        );
        increment_index_failures();
        false
    }
}
