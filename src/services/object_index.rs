//! Per-bucket index of known objects.
//!
//! The index answers existence and container queries from partial knowledge
//! gathered by listing calls. Each listed prefix records when it was last
//! refreshed and how deep; a query re-lists only when the subtree it depends
//! on was never listed or has gone stale.
//!
//! Folders are either synthetic (a common prefix reported by a delimited
//! listing) or real marker objects whose name ends with `/`.

use crate::{
    errors::{NavError, NavResult, Operation},
    models::{IndexedObject, ObjectMetadata},
    services::lister::ObjectLister,
    store::{ObjectPage, ObjectStoreClient},
};
use dashmap::DashMap;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Bound,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingDepth {
    /// One level, common prefixes collapsed by `/`.
    Shallow,
    /// Every key under the prefix.
    Recursive,
}

#[derive(Debug, Clone, Copy)]
struct Coverage {
    refreshed_at: Instant,
    depth: ListingDepth,
}

/// Where the index stood when a listing started.
///
/// Entries inserted after `epoch` are newer than anything the listing can
/// report. A listing taken before an invalidation (`generation` changed) is
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanTicket {
    epoch: u64,
    generation: u64,
}

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<String, IndexedObject>,
    coverage: BTreeMap<String, Coverage>,
    watermark: Option<Instant>,
    epoch: u64,
    generation: u64,
    /// Epoch of the last optimistic insert per key.
    inserted: HashMap<String, u64>,
}

/// Keys starting with `prefix`, in order.
fn under<'a, V>(
    map: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a V)> + 'a {
    map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(key, _)| key.starts_with(prefix))
}

/// Listing prefix of the folder containing `name`.
pub(crate) fn parent_prefix(name: &str) -> &str {
    match name.rfind('/') {
        Some(pos) => &name[..=pos],
        None => "",
    }
}

impl IndexState {
    fn is_fresh(&self, prefix: &str, depth: ListingDepth, staleness: Duration) -> bool {
        self.coverage.iter().any(|(covered, coverage)| {
            if coverage.refreshed_at.elapsed() > staleness {
                return false;
            }
            let Some(rest) = prefix.strip_prefix(covered.as_str()) else {
                return false;
            };
            match (coverage.depth, depth) {
                (ListingDepth::Recursive, _) => true,
                (ListingDepth::Shallow, ListingDepth::Shallow) => !rest.contains('/'),
                (ListingDepth::Shallow, ListingDepth::Recursive) => false,
            }
        })
    }

    fn ticket(&self) -> ScanTicket {
        ScanTicket {
            epoch: self.epoch,
            generation: self.generation,
        }
    }

    fn inserted_since(&self, key: &str, ticket: ScanTicket) -> bool {
        self.inserted
            .get(key)
            .is_some_and(|stamp| *stamp > ticket.epoch)
    }

    /// Insert a listed object; the store is the source of truth unless the
    /// engine wrote the key after the listing started.
    fn merge_listed(&mut self, metadata: ObjectMetadata, ticket: ScanTicket) {
        if self.inserted_since(&metadata.name, ticket) {
            return;
        }
        self.inserted.remove(&metadata.name);
        self.entries
            .insert(metadata.name.clone(), IndexedObject::real(metadata));
    }

    fn record_insert(&mut self, metadata: ObjectMetadata) {
        self.epoch += 1;
        self.inserted.insert(metadata.name.clone(), self.epoch);
        self.entries
            .insert(metadata.name.clone(), IndexedObject::real(metadata));
    }

    /// Record a common prefix without clobbering a real marker of the same name.
    fn merge_prefix(&mut self, prefix: String) {
        self.entries
            .entry(prefix.clone())
            .or_insert_with(|| IndexedObject::synthetic_folder(prefix));
    }

    /// Drop entries a completed listing of `prefix` is authoritative for
    /// and did not report.
    ///
    /// A recursive listing owns every key under the prefix. A shallow one
    /// owns the direct children, and any subfolder it did not report as a
    /// common prefix is gone together with everything beneath it.
    ///
    /// Entries inserted after the listing started are kept.
    fn prune(
        &mut self,
        prefix: &str,
        depth: ListingDepth,
        seen_names: &HashSet<String>,
        seen_prefixes: &HashSet<String>,
        ticket: ScanTicket,
    ) {
        let stale: Vec<String> = under(&self.entries, prefix)
            .filter(|(key, _)| {
                if seen_names.contains(key.as_str()) || self.inserted_since(key, ticket) {
                    return false;
                }
                let rest = &key[prefix.len()..];
                match (depth, rest.find('/')) {
                    (ListingDepth::Recursive, _) | (ListingDepth::Shallow, None) => true,
                    (ListingDepth::Shallow, Some(pos)) => {
                        let group = &key[..prefix.len() + pos + 1];
                        !seen_prefixes.contains(group)
                    }
                }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.inserted.remove(&key);
            self.entries.remove(&key);
        }
    }

    fn mark_covered(&mut self, prefix: &str, depth: ListingDepth) {
        let now = Instant::now();
        self.coverage.insert(
            prefix.to_string(),
            Coverage {
                refreshed_at: now,
                depth,
            },
        );
        self.watermark = Some(now);
    }

    fn has_descendant(&self, folder: &str) -> bool {
        under(&self.entries, folder).next().is_some()
    }
}

/// Index of the objects known to exist in one bucket.
pub struct BucketObjectIndex {
    bucket: String,
    store: Arc<dyn ObjectStoreClient>,
    staleness: Duration,
    page_size: usize,
    state: RwLock<IndexState>,
    refresh: Mutex<()>,
    registry: Weak<IndexMap>,
}

impl BucketObjectIndex {
    pub fn new(
        bucket: impl Into<String>,
        store: Arc<dyn ObjectStoreClient>,
        staleness: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            store,
            staleness,
            page_size,
            state: RwLock::new(IndexState::default()),
            refresh: Mutex::new(()),
            registry: Weak::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Time of the last completed refresh, if any.
    pub async fn watermark(&self) -> Option<Instant> {
        self.state.read().await.watermark
    }

    /// Make sure `prefix` has been listed at `depth` within the staleness
    /// bound, listing it now otherwise.
    ///
    /// Pages are gathered first and applied under one write lock, so readers
    /// see either the previous state or the refreshed one. A listing that
    /// raced an invalidation is thrown away and taken again.
    pub async fn ensure_fresh(
        &self,
        prefix: &str,
        depth: ListingDepth,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        if self
            .state
            .read()
            .await
            .is_fresh(prefix, depth, self.staleness)
        {
            return Ok(());
        }

        let _refreshing = self.refresh.lock().await;
        if self
            .state
            .read()
            .await
            .is_fresh(prefix, depth, self.staleness)
        {
            return Ok(());
        }

        loop {
            debug!(bucket = %self.bucket, prefix, ?depth, "refreshing index");
            let ticket = self.begin_scan().await;
            let listing = ObjectLister::new(
                self.store.clone(),
                self.bucket.clone(),
                prefix,
                depth == ListingDepth::Recursive,
                self.page_size,
                Operation::ItemExists,
                cancel.clone(),
            )
            .collect_all()
            .await;
            let listing = match listing {
                Ok(listing) => listing,
                Err(err) => {
                    self.note_failure(&err);
                    return Err(err);
                }
            };

            if self.apply_listing(prefix, depth, listing, ticket).await {
                return Ok(());
            }
            debug!(bucket = %self.bucket, prefix, "index invalidated during refresh");
        }
    }

    /// Ticket for a listing about to start.
    pub(crate) async fn begin_scan(&self) -> ScanTicket {
        self.state.read().await.ticket()
    }

    /// Forget this index in its registry when a listing shows the bucket
    /// does not exist.
    pub(crate) fn note_failure(&self, err: &NavError) {
        if !err.is_not_found() {
            return;
        }
        if let Some(indexes) = self.registry.upgrade() {
            indexes.remove_if(&self.bucket, |_, index| {
                std::ptr::eq(Arc::as_ptr(index), self)
            });
        }
    }

    async fn apply_listing(
        &self,
        prefix: &str,
        depth: ListingDepth,
        listing: ObjectPage,
        ticket: ScanTicket,
    ) -> bool {
        let seen_names: HashSet<String> = listing
            .items
            .iter()
            .map(|o| o.name.clone())
            .chain(listing.prefixes.iter().cloned())
            .collect();
        let seen_prefixes: HashSet<String> = listing.prefixes.iter().cloned().collect();

        let mut state = self.state.write().await;
        if state.generation != ticket.generation {
            return false;
        }
        state.prune(prefix, depth, &seen_names, &seen_prefixes, ticket);
        for object in listing.items {
            state.merge_listed(object, ticket);
        }
        for group in listing.prefixes {
            state.merge_prefix(group);
        }
        state.mark_covered(prefix, depth);
        true
    }

    /// Merge one page of an in-progress enumeration, in retrieval order.
    pub(crate) async fn merge_page(&self, page: &ObjectPage, ticket: ScanTicket) {
        let mut state = self.state.write().await;
        if state.generation != ticket.generation {
            return;
        }
        for object in &page.items {
            state.merge_listed(object.clone(), ticket);
        }
        for group in &page.prefixes {
            state.merge_prefix(group.clone());
        }
    }

    /// Close out an enumeration merged page by page: prune what it did not
    /// report and mark the prefix fresh.
    pub(crate) async fn complete_scan(
        &self,
        prefix: &str,
        depth: ListingDepth,
        seen_names: &HashSet<String>,
        seen_prefixes: &HashSet<String>,
        ticket: ScanTicket,
    ) {
        let mut state = self.state.write().await;
        if state.generation != ticket.generation {
            return;
        }
        state.prune(prefix, depth, seen_names, seen_prefixes, ticket);
        state.mark_covered(prefix, depth);
    }

    /// Entry at exactly `name` (a file name, or a folder name ending in `/`).
    pub async fn lookup(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> NavResult<Option<IndexedObject>> {
        let depends_on = if name.ends_with('/') {
            name
        } else {
            parent_prefix(name)
        };
        self.ensure_fresh(depends_on, ListingDepth::Shallow, cancel)
            .await?;
        Ok(self.state.read().await.entries.get(name).cloned())
    }

    /// Whether `name` exists as an object or as a folder.
    pub async fn exists(&self, name: &str, cancel: &CancellationToken) -> NavResult<bool> {
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Ok(true);
        }
        self.ensure_fresh(parent_prefix(name), ListingDepth::Shallow, cancel)
            .await?;
        let state = self.state.read().await;
        Ok(state.entries.contains_key(name) || state.has_descendant(&format!("{name}/")))
    }

    /// True for the bucket root; otherwise true iff a marker or any indexed
    /// entry lives under `name/`.
    pub async fn is_container(&self, name: &str, cancel: &CancellationToken) -> NavResult<bool> {
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Ok(true);
        }
        self.ensure_fresh(parent_prefix(name), ListingDepth::Shallow, cancel)
            .await?;
        Ok(self.state.read().await.has_descendant(&format!("{name}/")))
    }

    /// Whether anything other than the folder's own marker lives under `name/`.
    pub async fn has_children(&self, name: &str, cancel: &CancellationToken) -> NavResult<bool> {
        let name = name.trim_end_matches('/');
        let folder = if name.is_empty() {
            String::new()
        } else {
            format!("{name}/")
        };
        self.ensure_fresh(&folder, ListingDepth::Shallow, cancel)
            .await?;
        let state = self.state.read().await;
        Ok(under(&state.entries, &folder).any(|(key, _)| *key != folder))
    }

    /// Real object at `name`, or failing that the real marker at `name/`.
    pub async fn real_object(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> NavResult<Option<ObjectMetadata>> {
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(entry) = self.lookup(name, cancel).await? {
            if let Some(metadata) = entry.metadata {
                return Ok(Some(metadata));
            }
        }
        self.real_marker(name, cancel).await
    }

    /// Real marker object backing the folder `name`, if there is one.
    pub async fn real_marker(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> NavResult<Option<ObjectMetadata>> {
        let folder = format!("{}/", name.trim_end_matches('/'));
        Ok(self
            .lookup(&folder, cancel)
            .await?
            .and_then(|entry| entry.metadata))
    }

    pub async fn is_backed_by_real_object(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> NavResult<bool> {
        Ok(self.real_object(name, cancel).await?.is_some())
    }

    /// Metadata of the real object at `name`.
    pub async fn get(&self, name: &str, cancel: &CancellationToken) -> NavResult<ObjectMetadata> {
        self.real_object(name, cancel)
            .await?
            .ok_or_else(|| NavError::NotFound {
                path: format!("{}/{name}", self.bucket),
            })
    }

    /// Record a successful create or copy without re-listing.
    pub async fn insert(&self, metadata: ObjectMetadata) {
        if metadata.bucket != self.bucket {
            debug!(
                index = %self.bucket,
                bucket = %metadata.bucket,
                "ignoring insert for another bucket"
            );
            return;
        }
        self.state.write().await.record_insert(metadata);
    }

    /// Forget everything; the next query lists from empty.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.coverage.clear();
        state.inserted.clear();
        state.watermark = None;
        state.generation += 1;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

type IndexMap = DashMap<String, Arc<BucketObjectIndex>>;

/// Process-shared map from bucket name to its index, created lazily.
///
/// An index whose bucket turns out not to exist removes itself, so probing
/// unknown names does not grow the map.
pub struct IndexRegistry {
    store: Arc<dyn ObjectStoreClient>,
    staleness: Duration,
    page_size: usize,
    indexes: Arc<IndexMap>,
}

impl IndexRegistry {
    pub fn new(store: Arc<dyn ObjectStoreClient>, staleness: Duration, page_size: usize) -> Self {
        Self {
            store,
            staleness,
            page_size,
            indexes: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, bucket: &str) -> Arc<BucketObjectIndex> {
        self.indexes
            .entry(bucket.to_string())
            .or_insert_with(|| {
                let mut index =
                    BucketObjectIndex::new(bucket, self.store.clone(), self.staleness, self.page_size);
                index.registry = Arc::downgrade(&self.indexes);
                Arc::new(index)
            })
            .clone()
    }

    /// Drop the index of a deleted bucket.
    pub fn remove(&self, bucket: &str) {
        self.indexes.remove(bucket);
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.put_bucket("p", "b");
        store.put_object("b", "x.txt", "x");
        store.put_object("b", "dir/y.txt", "y");
        store.put_object("b", "marked/", "");
        Arc::new(store)
    }

    fn index(store: &Arc<MemoryStore>) -> BucketObjectIndex {
        BucketObjectIndex::new("b", store.clone(), Duration::from_secs(30), 100)
    }

    #[tokio::test]
    async fn test_should_infer_container_from_prefix() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        assert!(index.is_container("dir", &cancel).await.unwrap());
        assert!(!index.is_container("x.txt", &cancel).await.unwrap());
        assert!(index.exists("dir", &cancel).await.unwrap());
        assert!(!index.is_backed_by_real_object("dir", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_treat_marker_as_container_after_invalidate() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        assert!(index.is_container("marked", &cancel).await.unwrap());
        index.invalidate().await;
        assert!(index.watermark().await.is_none());
        assert!(index.is_container("marked", &cancel).await.unwrap());
        assert!(index.is_backed_by_real_object("marked", &cancel).await.unwrap());
        assert!(!index.has_children("marked", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_serve_repeat_queries_without_listing() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        index.exists("x.txt", &cancel).await.unwrap();
        index.exists("dir", &cancel).await.unwrap();
        index.is_container("dir", &cancel).await.unwrap();
        assert_eq!(store.calls("list_objects"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_refresh_after_staleness_bound() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        index.exists("x.txt", &cancel).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        index.exists("x.txt", &cancel).await.unwrap();
        assert_eq!(store.calls("list_objects"), 2);
    }

    #[tokio::test]
    async fn test_should_prune_vanished_subfolder() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        assert!(index.has_children("dir", &cancel).await.unwrap());
        store.delete_object("b", "dir/y.txt").await.unwrap();

        index
            .ensure_fresh("", ListingDepth::Shallow, &cancel)
            .await
            .unwrap();
        assert!(!index.exists("dir", &cancel).await.unwrap());
        assert!(index.exists("x.txt", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_keep_optimistic_insert_in_own_bucket_only() {
        let store = seeded();
        let index = index(&store);
        let cancel = CancellationToken::new();
        index.exists("x.txt", &cancel).await.unwrap();

        let mut other = store.put_object("b", "new.txt", "n");
        index.insert(other.clone()).await;
        assert!(index.exists("new.txt", &cancel).await.unwrap());

        other.bucket = "elsewhere".into();
        other.name = "foreign.txt".into();
        index.insert(other).await;
        assert!(!index.exists("foreign.txt", &cancel).await.unwrap());
        assert_eq!(store.calls("list_objects"), 1);
    }

    fn slow_three_pages() -> Arc<MemoryStore> {
        let store = MemoryStore::new()
            .with_page_size(1)
            .with_latency(Duration::from_millis(100));
        store.put_bucket("p", "b");
        for name in ["x1", "x2", "x3"] {
            store.put_object("b", name, "x");
        }
        Arc::new(store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_keep_insert_made_while_refresh_in_flight() {
        let store = slow_three_pages();
        let index = Arc::new(index(&store));
        let cancel = CancellationToken::new();

        let refreshing = {
            let index = index.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { index.exists("x1", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        let created = store.put_object("b", "a-new.txt", "n");
        index.insert(created).await;

        assert!(refreshing.await.unwrap().unwrap());
        let calls = store.calls("list_objects");
        assert!(index.exists("a-new.txt", &cancel).await.unwrap());
        assert_eq!(store.calls("list_objects"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_relist_when_invalidated_while_refresh_in_flight() {
        let store = slow_three_pages();
        let index = Arc::new(index(&store));
        let cancel = CancellationToken::new();

        let refreshing = {
            let index = index.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { index.exists("x3", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.delete_object("b", "x2").await.unwrap();
        index.invalidate().await;

        assert!(refreshing.await.unwrap().unwrap());
        assert!(!index.exists("x2", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_forget_index_of_missing_bucket() {
        let store = seeded();
        let registry = IndexRegistry::new(store.clone(), Duration::from_secs(30), 100);
        let cancel = CancellationToken::new();

        let err = registry
            .get("nobucket")
            .exists("x", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.is_empty());

        registry.get("b").exists("x.txt", &cancel).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_should_report_missing_bucket_as_not_found() {
        let store = seeded();
        let index = BucketObjectIndex::new("missing", store.clone(), Duration::from_secs(30), 100);
        let err = index
            .exists("x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
