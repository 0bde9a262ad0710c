//! In-process object store.
//!
//! Backs ephemeral shell sessions and the test suite. Every call is counted
//! per operation, and failures can be injected per project or per object
//! name so fan-out and transfer paths can be exercised.

use super::{
    BucketPage, ByteStream, CopyObjectRequest, InsertObjectRequest, ListObjectsParams,
    ObjectPage, ObjectStoreClient, ProjectPage, compute_common_prefix,
};
use crate::{
    errors::{StoreError, StoreResult},
    models::{BucketMetadata, ObjectMetadata, Project},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{StreamExt, stream};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    io,
    time::Duration,
};
use tracing::debug;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    meta: ObjectMetadata,
    data: Bytes,
}

#[derive(Default)]
struct MemoryState {
    projects: BTreeMap<String, Project>,
    buckets: BTreeMap<String, BucketMetadata>,
    /// Keyed by (bucket, name).
    objects: BTreeMap<(String, String), StoredObject>,
    generation: i64,
}

/// In-memory [`ObjectStoreClient`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    denied_projects: RwLock<HashSet<String>>,
    /// (operation, bucket/name or project) pairs that fail with a backend error.
    failures: RwLock<HashSet<(&'static str, String)>>,
    page_size: Option<usize>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every listing page at `page_size` entries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Delay every call, to widen concurrency windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn add_project(&self, id: &str) {
        self.state.write().projects.insert(
            id.to_string(),
            Project {
                id: id.to_string(),
                name: id.to_string(),
            },
        );
    }

    /// Make `list_buckets` for `project` fail with permission denied.
    pub fn deny_project(&self, project: &str) {
        self.denied_projects.write().insert(project.to_string());
    }

    /// Make `operation` fail for `target` (`bucket/name` for object calls,
    /// the bucket or project name otherwise).
    pub fn inject_failure(&self, operation: &'static str, target: &str) {
        self.failures.write().insert((operation, target.to_string()));
    }

    /// Store `data` at `bucket/name` directly, bypassing call accounting.
    pub fn put_object(&self, bucket: &str, name: &str, data: impl Into<Bytes>) -> ObjectMetadata {
        let data = data.into();
        let mut state = self.state.write();
        let meta = new_metadata(&mut state, bucket, name, None, &data, BTreeMap::new());
        state.objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                meta: meta.clone(),
                data,
            },
        );
        meta
    }

    /// Create `bucket` in `project` directly, bypassing call accounting.
    pub fn put_bucket(&self, project: &str, bucket: &str) -> BucketMetadata {
        self.add_project(project);
        let meta = bucket_metadata(project, bucket);
        self.state
            .write()
            .buckets
            .insert(bucket.to_string(), meta.clone());
        meta
    }

    pub fn contains_object(&self, bucket: &str, name: &str) -> bool {
        self.state
            .read()
            .objects
            .contains_key(&(bucket.to_string(), name.to_string()))
    }

    pub fn object_data(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.state
            .read()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|o| o.data.clone())
    }

    /// Number of calls made to `operation` (e.g. `"list_objects"`).
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    async fn enter(&self, operation: &'static str, target: &str) -> StoreResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self
            .failures
            .read()
            .contains(&(operation, target.to_string()))
        {
            return Err(StoreError::Backend(format!(
                "injected failure for {operation} on {target}"
            )));
        }
        Ok(())
    }

    fn limit(&self, requested: usize) -> usize {
        match self.page_size {
            Some(cap) => requested.min(cap),
            None => requested,
        }
    }
}

fn bucket_metadata(project: &str, bucket: &str) -> BucketMetadata {
    BucketMetadata {
        name: bucket.to_string(),
        project: project.to_string(),
        location: "local".into(),
        storage_class: "STANDARD".into(),
        created_at: Utc::now(),
    }
}

fn new_metadata(
    state: &mut MemoryState,
    bucket: &str,
    name: &str,
    content_type: Option<String>,
    data: &[u8],
    metadata: BTreeMap<String, String>,
) -> ObjectMetadata {
    state.generation += 1;
    ObjectMetadata {
        bucket: bucket.to_string(),
        name: name.to_string(),
        size: data.len() as u64,
        content_type,
        etag: Some(format!("{:x}", md5::compute(data))),
        generation: state.generation,
        storage_class: "STANDARD".into(),
        updated: Utc::now(),
        media_link: Some(format!("memory://{bucket}/{name}")),
        metadata,
    }
}

/// Skip-ahead token paging over an ordered key space.
fn page_after<'a, T>(
    entries: impl Iterator<Item = (&'a String, T)>,
    token: Option<&str>,
    limit: usize,
) -> (Vec<T>, Option<String>) {
    let mut page = Vec::new();
    let mut last = None;
    let mut more = false;
    for (key, value) in entries.filter(|(key, _)| token.is_none_or(|t| key.as_str() > t)) {
        if page.len() == limit {
            more = true;
            break;
        }
        last = Some(key.clone());
        page.push(value);
    }
    (page, if more { last } else { None })
}

#[async_trait]
impl ObjectStoreClient for MemoryStore {
    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> StoreResult<ObjectPage> {
        self.enter("list_objects", bucket).await?;
        let state = self.state.read();
        if !state.buckets.contains_key(bucket) {
            return Err(StoreError::NotFound(format!("bucket {bucket}")));
        }

        let prefix = params.prefix.as_deref().unwrap_or("");
        let keys = state
            .objects
            .range((bucket.to_string(), prefix.to_string())..)
            .take_while(|((b, name), _)| b == bucket && name.starts_with(prefix))
            .map(|((_, name), object)| (name, object));
        let (rows, next_page_token) = page_after(
            keys,
            params.page_token.as_deref(),
            self.limit(params.page_size()),
        );

        let mut items = Vec::new();
        let mut prefixes = BTreeSet::new();
        for object in rows {
            if let Some(delimiter) = params.delimiter.as_deref() {
                if let Some(group) =
                    compute_common_prefix(&object.meta.name, params.prefix.as_deref(), delimiter)
                {
                    prefixes.insert(group);
                    continue;
                }
            }
            items.push(object.meta.clone());
        }
        debug!(
            bucket,
            prefix,
            items = items.len(),
            prefixes = prefixes.len(),
            "memory list_objects"
        );

        Ok(ObjectPage {
            items,
            prefixes: prefixes.into_iter().collect(),
            next_page_token,
        })
    }

    async fn get_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectMetadata> {
        self.enter("get_object", &format!("{bucket}/{name}")).await?;
        self.state
            .read()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|o| o.meta.clone())
            .ok_or_else(|| StoreError::NotFound(format!("object {bucket}/{name}")))
    }

    async fn open_download(&self, object: &ObjectMetadata) -> StoreResult<ByteStream> {
        let target = format!("{}/{}", object.bucket, object.name);
        self.enter("open_download", &target).await?;
        let data = self
            .state
            .read()
            .objects
            .get(&(object.bucket.clone(), object.name.clone()))
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound(format!("object {target}")))?;

        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(DOWNLOAD_CHUNK)
            .map(|chunk| Ok(data.slice_ref(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn insert_object(
        &self,
        request: InsertObjectRequest,
        mut body: ByteStream,
    ) -> StoreResult<ObjectMetadata> {
        let target = format!("{}/{}", request.bucket, request.name);
        self.enter("insert_object", &target).await?;
        if !self.state.read().buckets.contains_key(&request.bucket) {
            return Err(StoreError::NotFound(format!("bucket {}", request.bucket)));
        }

        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let data = buffer.freeze();

        let mut state = self.state.write();
        let meta = new_metadata(
            &mut state,
            &request.bucket,
            &request.name,
            request.content_type,
            &data,
            request.metadata,
        );
        state.objects.insert(
            (request.bucket, request.name),
            StoredObject {
                meta: meta.clone(),
                data,
            },
        );
        Ok(meta)
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<ObjectMetadata> {
        let target = format!("{}/{}", request.src_bucket, request.src_name);
        self.enter("copy_object", &target).await?;

        let mut state = self.state.write();
        if !state.buckets.contains_key(&request.dst_bucket) {
            return Err(StoreError::NotFound(format!("bucket {}", request.dst_bucket)));
        }
        let source = state
            .objects
            .get(&(request.src_bucket.clone(), request.src_name.clone()))
            .filter(|o| {
                request
                    .source_generation
                    .is_none_or(|generation| o.meta.generation == generation)
            })
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("object {target}")))?;

        let meta = new_metadata(
            &mut state,
            &request.dst_bucket,
            &request.dst_name,
            request.content_type.or(source.meta.content_type),
            &source.data,
            request.metadata.unwrap_or(source.meta.metadata),
        );
        state.objects.insert(
            (request.dst_bucket, request.dst_name),
            StoredObject {
                meta: meta.clone(),
                data: source.data,
            },
        );
        Ok(meta)
    }

    async fn delete_object(&self, bucket: &str, name: &str) -> StoreResult<()> {
        self.enter("delete_object", &format!("{bucket}/{name}")).await?;
        self.state
            .write()
            .objects
            .remove(&(bucket.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("object {bucket}/{name}")))
    }

    async fn list_projects(&self, page_token: Option<String>) -> StoreResult<ProjectPage> {
        self.enter("list_projects", "").await?;
        let state = self.state.read();
        let (projects, next_page_token) = page_after(
            state.projects.iter(),
            page_token.as_deref(),
            self.limit(super::MAX_PAGE_SIZE),
        );
        Ok(ProjectPage {
            projects: projects.into_iter().cloned().collect(),
            next_page_token,
        })
    }

    async fn list_buckets(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> StoreResult<BucketPage> {
        self.enter("list_buckets", project).await?;
        if self.denied_projects.read().contains(project) {
            return Err(StoreError::PermissionDenied(format!("project {project}")));
        }
        let state = self.state.read();
        let (buckets, next_page_token) = page_after(
            state.buckets.iter().filter(|(_, b)| b.project == project),
            page_token.as_deref(),
            self.limit(super::MAX_PAGE_SIZE),
        );
        Ok(BucketPage {
            buckets: buckets.into_iter().cloned().collect(),
            next_page_token,
        })
    }

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketMetadata> {
        self.enter("get_bucket", name).await?;
        self.state
            .read()
            .buckets
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("bucket {name}")))
    }

    async fn insert_bucket(&self, project: &str, name: &str) -> StoreResult<BucketMetadata> {
        self.enter("insert_bucket", name).await?;
        let mut state = self.state.write();
        if state.buckets.contains_key(name) {
            return Err(StoreError::AlreadyExists(format!("bucket {name}")));
        }
        state
            .projects
            .entry(project.to_string())
            .or_insert_with(|| Project {
                id: project.to_string(),
                name: project.to_string(),
            });
        let meta = bucket_metadata(project, name);
        state.buckets.insert(name.to_string(), meta.clone());
        Ok(meta)
    }

    async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        self.enter("delete_bucket", name).await?;
        let mut state = self.state.write();
        if state.objects.keys().any(|(bucket, _)| bucket == name) {
            return Err(StoreError::InvalidArgument(format!(
                "bucket {name} is not empty"
            )));
        }
        state
            .buckets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("bucket {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_bucket("p1", "b");
        store.put_object("b", "x.txt", "x");
        store.put_object("b", "dir/y.txt", "y");
        store.put_object("b", "dir/sub/z.txt", "z");
        store
    }

    #[tokio::test]
    async fn test_should_collapse_prefixes_with_delimiter() {
        let store = seeded();
        let page = store
            .list_objects(
                "b",
                &ListObjectsParams {
                    delimiter: Some("/".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["x.txt"]);
        assert_eq!(page.prefixes, vec!["dir/".to_string()]);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_should_page_through_listing() {
        let store = seeded().with_page_size(2);
        let first = store
            .list_objects("b", &ListObjectsParams::default())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.next_page_token.clone();
        assert!(token.is_some());

        let second = store
            .list_objects(
                "b",
                &ListObjectsParams {
                    page_token: token,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_page_token.is_none());
        assert_eq!(store.calls("list_objects"), 2);
    }

    #[tokio::test]
    async fn test_should_deny_listed_project() {
        let store = seeded();
        store.deny_project("p1");
        let err = store.list_buckets("p1", None).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_should_copy_preserving_metadata() {
        let store = seeded();
        let copied = store
            .copy_object(CopyObjectRequest {
                src_bucket: "b".into(),
                src_name: "x.txt".into(),
                dst_bucket: "b".into(),
                dst_name: "x-copy.txt".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(copied.size, 1);
        assert_eq!(store.object_data("b", "x-copy.txt").unwrap(), Bytes::from("x"));
    }

    #[tokio::test]
    async fn test_should_refuse_deleting_populated_bucket() {
        let store = seeded();
        let err = store.delete_bucket("b").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
