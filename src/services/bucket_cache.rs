//! Process-wide cache of every bucket visible to the caller.
//!
//! The cache is populated wholesale by enumerating projects and then, one
//! task per project, their buckets. Readers never see a half-populated map:
//! a refresh builds the new contents off to the side and swaps them in under
//! the write lock.

use crate::{
    errors::{NavError, NavResult, Operation, StoreError},
    models::BucketMetadata,
    store::ObjectStoreClient,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{RwLock, Semaphore},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct CacheState {
    buckets: BTreeMap<String, BucketMetadata>,
    populated_at: Option<Instant>,
}

impl CacheState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.populated_at
            .is_some_and(|populated| populated.elapsed() <= ttl)
    }
}

pub struct ProjectBucketCache {
    store: Arc<dyn ObjectStoreClient>,
    ttl: Duration,
    max_concurrency: usize,
    state: RwLock<CacheState>,
}

impl ProjectBucketCache {
    pub fn new(store: Arc<dyn ObjectStoreClient>, ttl: Duration, max_concurrency: usize) -> Self {
        Self {
            store,
            ttl,
            max_concurrency: max_concurrency.max(1),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Every cached bucket, refreshing first if the cache is stale.
    pub async fn list_all_buckets(
        &self,
        cancel: &CancellationToken,
    ) -> NavResult<Vec<BucketMetadata>> {
        {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                return Ok(state.buckets.values().cloned().collect());
            }
        }
        let state = self.populate(cancel).await?;
        Ok(state.buckets.values().cloned().collect())
    }

    /// Re-enumerate if the cache is older than its TTL or was invalidated.
    pub async fn refresh(&self, cancel: &CancellationToken) -> NavResult<()> {
        if self.state.read().await.is_fresh(self.ttl) {
            return Ok(());
        }
        self.populate(cancel).await.map(|_| ())
    }

    /// Force the next read to re-enumerate.
    pub async fn invalidate(&self) {
        self.state.write().await.populated_at = None;
    }

    /// Cached metadata for `name`, only while the cache is fresh.
    pub async fn peek(&self, name: &str) -> Option<BucketMetadata> {
        let state = self.state.read().await;
        if !state.is_fresh(self.ttl) {
            return None;
        }
        state.buckets.get(name).cloned()
    }

    /// Populate under the write lock, so concurrent stale readers wait for
    /// one enumeration instead of each issuing their own.
    async fn populate(
        &self,
        cancel: &CancellationToken,
    ) -> NavResult<tokio::sync::RwLockWriteGuard<'_, CacheState>> {
        let mut state = self.state.write().await;
        if state.is_fresh(self.ttl) {
            return Ok(state);
        }

        let buckets = self.enumerate(cancel).await?;
        info!(buckets = buckets.len(), "bucket cache populated");
        state.buckets = buckets
            .into_iter()
            .map(|bucket| (bucket.name.clone(), bucket))
            .collect();
        state.populated_at = Some(Instant::now());
        Ok(state)
    }

    async fn list_projects(&self, cancel: &CancellationToken) -> NavResult<Vec<String>> {
        let mut projects = Vec::new();
        let mut page_token = None;
        loop {
            if cancel.is_cancelled() {
                return Err(NavError::cancelled(Operation::GetChildItems, ""));
            }
            let page = self
                .store
                .list_projects(page_token)
                .await
                .map_err(|err| NavError::from_store(Operation::GetChildItems, "", err))?;
            projects.extend(page.projects.into_iter().map(|p| p.id));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(projects)
    }

    async fn enumerate(&self, cancel: &CancellationToken) -> NavResult<Vec<BucketMetadata>> {
        let projects = self.list_projects(cancel).await?;
        debug!(projects = projects.len(), "enumerating buckets");

        // Cancelled on the first hard failure so queued projects stop early.
        let abort = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for project in projects {
            let store = self.store.clone();
            let permits = permits.clone();
            let abort = abort.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| NavError::cancelled(Operation::GetChildItems, project.clone()))?;
                list_project_buckets(store.as_ref(), &project, &abort).await
            });
        }

        let mut buckets = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(NavError::Store {
                    operation: Operation::GetChildItems,
                    path: String::new(),
                    source: StoreError::Backend(err.to_string()),
                })
            });
            match result {
                Ok(found) => buckets.extend(found),
                Err(err) => {
                    abort.cancel();
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            if cancel.is_cancelled() {
                return Err(NavError::cancelled(Operation::GetChildItems, ""));
            }
            return Err(err);
        }
        Ok(buckets)
    }
}

/// All buckets of one project. Permission denied counts as zero buckets.
async fn list_project_buckets(
    store: &dyn ObjectStoreClient,
    project: &str,
    cancel: &CancellationToken,
) -> NavResult<Vec<BucketMetadata>> {
    let mut buckets = Vec::new();
    let mut page_token = None;
    loop {
        if cancel.is_cancelled() {
            return Err(NavError::cancelled(Operation::GetChildItems, project));
        }
        let page = match store.list_buckets(project, page_token).await {
            Ok(page) => page,
            Err(err) if err.is_permission_denied() => {
                warn!(project, %err, "skipping project");
                return Ok(Vec::new());
            }
            Err(err) => return Err(NavError::from_store(Operation::GetChildItems, project, err)),
        };
        if cancel.is_cancelled() {
            return Err(NavError::cancelled(Operation::GetChildItems, project));
        }
        buckets.extend(page.buckets);
        page_token = page.next_page_token;
        if page_token.is_none() {
            return Ok(buckets);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.put_bucket("p1", "alpha");
        store.put_bucket("p2", "beta");
        store.put_bucket("p3", "gamma");
        Arc::new(store)
    }

    fn names(buckets: &[BucketMetadata]) -> Vec<&str> {
        buckets.iter().map(|b| b.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_should_enumerate_every_project() {
        let store = store();
        let cache = ProjectBucketCache::new(store.clone(), Duration::from_secs(60), 4);
        let buckets = cache
            .list_all_buckets(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&buckets), vec!["alpha", "beta", "gamma"]);
        assert_eq!(store.calls("list_buckets"), 3);
    }

    #[tokio::test]
    async fn test_should_skip_denied_project() {
        let store = store();
        store.deny_project("p2");
        let cache = ProjectBucketCache::new(store.clone(), Duration::from_secs(60), 4);
        let buckets = cache
            .list_all_buckets(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(names(&buckets), vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_should_abort_on_other_errors_and_keep_previous_contents() {
        let store = store();
        let cache = ProjectBucketCache::new(store.clone(), Duration::from_secs(60), 4);
        let cancel = CancellationToken::new();
        cache.refresh(&cancel).await.unwrap();

        store.inject_failure("list_buckets", "p3");
        cache.invalidate().await;
        assert!(cache.refresh(&cancel).await.is_err());
        assert!(cache.peek("alpha").await.is_none());

        let state = cache.state.read().await;
        assert_eq!(state.buckets.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_honour_ttl_and_invalidate() {
        let store = store();
        let cache = ProjectBucketCache::new(store.clone(), Duration::from_secs(60), 4);
        let cancel = CancellationToken::new();

        cache.refresh(&cancel).await.unwrap();
        let after_first = store.total_calls();
        cache.refresh(&cancel).await.unwrap();
        assert_eq!(store.total_calls(), after_first);
        assert!(cache.peek("beta").await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.refresh(&cancel).await.unwrap();
        assert_eq!(store.total_calls(), after_first * 2);

        cache.invalidate().await;
        cache.refresh(&cancel).await.unwrap();
        assert_eq!(store.total_calls(), after_first * 3);
    }

    #[tokio::test]
    async fn test_should_stop_when_cancelled() {
        let store = store();
        let cache = ProjectBucketCache::new(store.clone(), Duration::from_secs(60), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache.refresh(&cancel).await.unwrap_err();
        assert!(matches!(err, NavError::Cancelled { .. }));
        assert_eq!(store.total_calls(), 0);
    }
}
