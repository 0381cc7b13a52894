//! The Object-ID Provider (C11): paged enumeration and existence/count
//! queries over documents, scoped by `object_name`.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::document::{self, DocumentStore, ObjectDocument};

/// One page of an [`ObjectIdProvider::page`] enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Object ids in this page, in provider-defined order.
    pub object_ids: Vec<String>,
    /// Opaque token to fetch the next page, or `None` if this was the last.
    pub continuation_token: Option<String>,
}

/// The Object-ID Provider contract.
///
/// Paging is single-partition: `object_name` is the partition key, matching
/// the Document Store's own partitioning.
#[async_trait::async_trait]
pub trait ObjectIdProvider: Send + Sync {
    /// Returns `true` if a document exists for `(object_name, object_id)`.
    async fn exists(&self, object_name: &str, object_id: &str) -> Result<bool, document::Error>;

    /// Counts documents for `object_name`.
    async fn count(&self, object_name: &str) -> Result<u64, document::Error>;

    /// Returns one page of object ids for `object_name`, continuing from
    /// `continuation_token` if given.
    async fn page(
        &self,
        object_name: &str,
        continuation_token: Option<&str>,
        page_size: usize,
    ) -> Result<Page, document::Error>;
}

/// In-memory reference implementation of [`ObjectIdProvider`], backed by the
/// same storage as [`crate::document::InMemory`].
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    documents: Arc<RwLock<Vec<ObjectDocument>>>,
}

impl InMemory {
    /// Builds a provider that snapshots `store`'s contents on each call.
    ///
    /// The in-memory [`DocumentStore`] does not expose raw enumeration, so
    /// this reference provider keeps its own mirrored list, appended to by
    /// [`InMemory::observe`] whenever a document is created or updated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or updates) a document in the provider's mirror; call this
    /// from the same code path that calls [`DocumentStore::create`]/`set`.
    pub async fn observe(&self, document: ObjectDocument) {
        let mut docs = self.documents.write().await;
        if let Some(existing) = docs
            .iter_mut()
            .find(|d| d.object_name == document.object_name && d.object_id == document.object_id)
        {
            *existing = document;
        } else {
            docs.push(document);
        }
    }
}

#[async_trait::async_trait]
impl ObjectIdProvider for InMemory {
    async fn exists(&self, object_name: &str, object_id: &str) -> Result<bool, document::Error> {
        let docs = self.documents.read().await;
        Ok(docs
            .iter()
            .any(|d| d.object_name == object_name && d.object_id == object_id))
    }

    async fn count(&self, object_name: &str) -> Result<u64, document::Error> {
        let docs = self.documents.read().await;
        Ok(docs.iter().filter(|d| d.object_name == object_name).count() as u64)
    }

    async fn page(
        &self,
        object_name: &str,
        continuation_token: Option<&str>,
        page_size: usize,
    ) -> Result<Page, document::Error> {
        let docs = self.documents.read().await;
        let mut ids: Vec<&str> = docs
            .iter()
            .filter(|d| d.object_name == object_name)
            .map(|d| d.object_id.as_str())
            .collect();
        ids.sort_unstable();

        let start = match continuation_token {
            Some(token) => ids.iter().position(|id| *id == token).map_or(0, |i| i + 1),
            None => 0,
        };

        let page_size = page_size.max(1);
        let end = (start + page_size).min(ids.len());
        let object_ids: Vec<String> = ids[start..end].iter().map(|s| s.to_string()).collect();

        let continuation_token = if end < ids.len() {
            object_ids.last().cloned()
        } else {
            None
        };

        Ok(Page {
            object_ids,
            continuation_token,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::document::ObjectDocument;

    #[tokio::test]
    async fn paging_walks_every_id_once() {
        let provider = InMemory::new();
        for i in 0..5 {
            provider
                .observe(ObjectDocument::new("order", format!("o{i}"), "order-stream"))
                .await;
        }

        let mut seen = Vec::new();
        let mut token = None;

        loop {
            let page = provider.page("order", token.as_deref(), 2).await.unwrap();
            seen.extend(page.object_ids);

            if page.continuation_token.is_none() {
                break;
            }
            token = page.continuation_token;
        }

        seen.sort();
        assert_eq!(seen, vec!["o0", "o1", "o2", "o3", "o4"]);
    }

    #[tokio::test]
    async fn exists_and_count_reflect_observed_documents() {
        let provider = InMemory::new();
        assert!(!provider.exists("order", "o1").await.unwrap());

        provider.observe(ObjectDocument::new("order", "o1", "order-stream")).await;

        assert!(provider.exists("order", "o1").await.unwrap());
        assert_eq!(provider.count("order").await.unwrap(), 1);
    }
}
