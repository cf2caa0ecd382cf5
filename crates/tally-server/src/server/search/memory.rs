use super::{IndexDocument, SearchIndex, matches_all, tokenize};
use crate::common::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-process index. Used by tests and by `serve` when no index URL is
/// configured.
#[derive(Default)]
pub struct MemoryIndex {
    docs: RwLock<BTreeMap<i64, IndexDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<IndexDocument> {
        self.docs.read().get(&id).cloned()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert(&self, doc: IndexDocument) -> Result<()> {
        self.docs.write().insert(doc.id, doc);
        Ok(())
    }

    async fn search(
        &self,
        parent_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        let terms = tokenize(query);
        Ok(self
            .docs
            .read()
            .values()
            .filter(|doc| doc.parent_id == parent_id && matches_all(&doc.body, &terms))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove_parents(&self, parent_ids: &[i64]) -> Result<u64> {
        let mut docs = self.docs.write();
        let before = docs.len();
        docs.retain(|_, doc| !parent_ids.contains(&doc.parent_id));
        Ok((before - docs.len()) as u64)
    }

    async fn clear(&self) -> Result<u64> {
        let mut docs = self.docs.write();
        let removed = docs.len() as u64;
        docs.clear();
        Ok(removed)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.docs.read().len() as u64)
    }
}
