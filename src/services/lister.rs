//! Pull-based cursor over paginated object listings.
//!
//! Pages are fetched one at a time as the caller asks for them, so memory
//! stays bounded by the page size. A cursor cannot be resumed across
//! processes; restarting means re-issuing the listing.

use crate::{
    errors::{NavError, NavResult, Operation},
    store::{ListObjectsParams, ObjectPage, ObjectStoreClient},
};
use futures::{Stream, stream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lists `bucket` under `prefix`, either one level deep (delimiter `/`) or
/// recursively (no delimiter).
pub struct ObjectLister {
    store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    params: ListObjectsParams,
    operation: Operation,
    cancel: CancellationToken,
    pages: usize,
    done: bool,
}

impl ObjectLister {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        recursive: bool,
        page_size: usize,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            store,
            bucket: bucket.into(),
            params: ListObjectsParams {
                prefix: (!prefix.is_empty()).then_some(prefix),
                delimiter: (!recursive).then(|| "/".to_string()),
                page_token: None,
                max_results: page_size,
            },
            operation,
            cancel,
            pages: 0,
            done: false,
        }
    }

    pub fn prefix(&self) -> &str {
        self.params.prefix.as_deref().unwrap_or("")
    }

    fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.prefix())
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    ///
    /// No call is issued after cancellation; a page whose call was in flight
    /// when cancellation arrived is discarded.
    pub async fn next_page(&mut self) -> NavResult<Option<ObjectPage>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Err(NavError::cancelled(self.operation, self.location()));
        }

        let result = self.store.list_objects(&self.bucket, &self.params).await;
        if self.cancel.is_cancelled() {
            self.done = true;
            return Err(NavError::cancelled(self.operation, self.location()));
        }
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Err(NavError::from_store(self.operation, self.location(), err));
            }
        };

        self.pages += 1;
        debug!(
            bucket = %self.bucket,
            prefix = self.prefix(),
            page = self.pages,
            items = page.items.len(),
            prefixes = page.prefixes.len(),
            "listed page"
        );
        self.params.page_token = page.next_page_token.clone();
        if self.params.page_token.is_none() {
            self.done = true;
        }
        Ok(Some(page))
    }

    /// Drain every remaining page into one.
    pub async fn collect_all(mut self) -> NavResult<ObjectPage> {
        let mut all = ObjectPage::default();
        while let Some(page) = self.next_page().await? {
            all.items.extend(page.items);
            all.prefixes.extend(page.prefixes);
        }
        all.prefixes.sort();
        all.prefixes.dedup();
        Ok(all)
    }

    pub fn into_stream(self) -> impl Stream<Item = NavResult<ObjectPage>> {
        stream::try_unfold(self, |mut lister| async move {
            Ok(lister.next_page().await?.map(|page| (page, lister)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::TryStreamExt;

    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new().with_page_size(2);
        store.put_bucket("p", "b");
        for name in ["a", "b", "c", "d", "e"] {
            store.put_object("b", name, "-");
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_should_fetch_pages_lazily() {
        let store = store();
        let mut lister = ObjectLister::new(
            store.clone(),
            "b",
            "",
            true,
            100,
            Operation::GetChildItems,
            CancellationToken::new(),
        );
        assert_eq!(store.calls("list_objects"), 0);
        let first = lister.next_page().await.unwrap().unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(store.calls("list_objects"), 1);
    }

    #[tokio::test]
    async fn test_should_stream_every_page() {
        let store = store();
        let lister = ObjectLister::new(
            store.clone(),
            "b",
            "",
            true,
            100,
            Operation::GetChildItems,
            CancellationToken::new(),
        );
        let pages: Vec<_> = lister.into_stream().try_collect().await.unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.iter().map(|p| p.items.len()).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_should_stop_issuing_calls_once_cancelled() {
        let store = store();
        let cancel = CancellationToken::new();
        let mut lister = ObjectLister::new(
            store.clone(),
            "b",
            "",
            true,
            100,
            Operation::GetChildItems,
            cancel.clone(),
        );
        lister.next_page().await.unwrap();
        cancel.cancel();
        let err = lister.next_page().await.unwrap_err();
        assert!(matches!(err, NavError::Cancelled { .. }));
        assert_eq!(store.calls("list_objects"), 1);
    }
}
