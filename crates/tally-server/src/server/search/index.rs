use crate::common::{
    Result,
    types::{Entry, now_millis},
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// The indexed projection of one entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct IndexDocument {
    pub id: i64,
    pub parent_id: i64,
    pub body: String,
    pub indexed_at: i64,
}

impl IndexDocument {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            id: entry.id,
            parent_id: entry.parent_id,
            body: entry.body.clone(),
            indexed_at: now_millis(),
        }
    }
}

/// A text index of entry bodies, scoped by thread.
///
/// Writes are upserts keyed by document id, so republishing the same entry
/// any number of times leaves exactly one document.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, doc: IndexDocument) -> Result<()>;

    async fn upsert_batch(&self, docs: Vec<IndexDocument>) -> Result<usize> {
        let count = docs.len();
        for doc in docs {
            self.upsert(doc).await?;
        }
        Ok(count)
    }

    /// Documents under `parent_id` whose body contains every term of `query`,
    /// ordered by id, at most `limit`.
    async fn search(&self, parent_id: i64, query: &str, limit: usize)
    -> Result<Vec<IndexDocument>>;

    /// Removes every document under any of `parent_ids`. Returns how many
    /// were removed.
    async fn remove_parents(&self, parent_ids: &[i64]) -> Result<u64>;

    /// Removes every document.
    async fn clear(&self) -> Result<u64>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
impl<S> SearchIndex for Arc<S>
where
    S: SearchIndex + ?Sized,
{
    async fn upsert(&self, doc: IndexDocument) -> Result<()> {
        (**self).upsert(doc).await
    }

    async fn upsert_batch(&self, docs: Vec<IndexDocument>) -> Result<usize> {
        (**self).upsert_batch(docs).await
    }

    async fn search(
        &self,
        parent_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        (**self).search(parent_id, query, limit).await
    }

    async fn remove_parents(&self, parent_ids: &[i64]) -> Result<u64> {
        (**self).remove_parents(parent_ids).await
    }

    async fn clear(&self) -> Result<u64> {
        (**self).clear().await
    }

    async fn count(&self) -> Result<u64> {
        (**self).count().await
    }
}

/// Lowercased alphanumeric terms of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `body` contains every term in `terms` as a whole token.
///
/// An empty term list matches nothing.
pub fn matches_all(body: &str, terms: &[String]) -> bool {
    if terms.is_empty() {
        return false;
    }
    let tokens = tokenize(body);
    terms.iter().all(|term| tokens.contains(term))
}
