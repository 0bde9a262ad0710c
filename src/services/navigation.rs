//! The navigation engine: drive/bucket/folder semantics over a flat store.
//!
//! Every top-level operation that telemetry knows about reports exactly once,
//! however many store calls it issued. Existence and container probes do not
//! report and never fail for absence.

use crate::{
    config::NavigatorConfig,
    errors::{NavError, NavResult, Operation, StoreError},
    models::{BucketMetadata, ChildItem, Item, ObjectMetadata, ObjectPath, PathKind},
    services::{
        bucket_cache::ProjectBucketCache,
        children::ChildCursor,
        content_stream::{ContentReader, ContentStreamBridge, ContentWriter},
        lister::ObjectLister,
        object_index::{BucketObjectIndex, IndexRegistry},
    },
    store::{CopyObjectRequest, ObjectStoreClient, ObjectStoreClientExt},
    telemetry::{OnceReporter, Telemetry, TracingTelemetry},
};
use bytes::Bytes;
use std::{future::Future, path::PathBuf, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Component name attached to every telemetry report.
pub const COMPONENT: &str = "bucket-drive";

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Payload for [`NavigationEngine::new_item`].
#[derive(Debug, Clone)]
pub enum NewItemContent {
    /// An empty marker object; the path gains a trailing `/`.
    Folder,
    Text(String),
    Bytes(Bytes),
    /// Upload the contents of a local file.
    File(PathBuf),
}

/// Where a child enumeration draws its entries from.
enum ChildSource {
    Buckets(Vec<BucketMetadata>),
    Single(ObjectMetadata),
    Listing(ObjectLister, Arc<BucketObjectIndex>),
}

pub struct NavigationEngine {
    store: Arc<dyn ObjectStoreClient>,
    config: NavigatorConfig,
    buckets: Arc<ProjectBucketCache>,
    indexes: IndexRegistry,
    content: ContentStreamBridge,
    telemetry: Arc<dyn Telemetry>,
}

fn object_location(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}

impl NavigationEngine {
    pub fn new(store: Arc<dyn ObjectStoreClient>, config: NavigatorConfig) -> Self {
        let buckets = Arc::new(ProjectBucketCache::new(
            store.clone(),
            config.bucket_cache_ttl,
            config.max_concurrency,
        ));
        let indexes = IndexRegistry::new(store.clone(), config.index_staleness, config.page_size);
        Self {
            content: ContentStreamBridge::new(store.clone()),
            store,
            config,
            buckets,
            indexes,
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    pub fn bucket_cache(&self) -> &Arc<ProjectBucketCache> {
        &self.buckets
    }

    pub fn index(&self, bucket: &str) -> Arc<BucketObjectIndex> {
        self.indexes.get(bucket)
    }

    fn report<T>(&self, operation: Operation, result: NavResult<T>) -> NavResult<T> {
        match &result {
            Ok(_) => self.telemetry.report_success(COMPONENT, operation),
            Err(err) => self.telemetry.report_failure(COMPONENT, operation, err),
        }
        result
    }

    fn check_cancel(
        cancel: &CancellationToken,
        operation: Operation,
        path: &ObjectPath,
    ) -> NavResult<()> {
        if cancel.is_cancelled() {
            return Err(NavError::cancelled(operation, path.render()));
        }
        Ok(())
    }

    // ---- existence and containment ----

    /// Whether `path` exists. Absence is `Ok(false)`, never an error.
    pub async fn exists(&self, path: &ObjectPath, cancel: &CancellationToken) -> NavResult<bool> {
        let result = match (path.bucket_name(), path.trimmed_name()) {
            (None, _) => Ok(true),
            (Some(bucket), None) => self.bucket_exists(bucket).await,
            (Some(bucket), Some(name)) => self.index(bucket).exists(name, cancel).await,
        };
        absent_is_false(result)
    }

    /// Drive and buckets are always containers; objects are when a marker
    /// or any descendant exists.
    pub async fn is_container(
        &self,
        path: &ObjectPath,
        cancel: &CancellationToken,
    ) -> NavResult<bool> {
        match (path.bucket_name(), path.trimmed_name()) {
            (Some(bucket), Some(name)) => {
                absent_is_false(self.index(bucket).is_container(name, cancel).await)
            }
            _ => Ok(true),
        }
    }

    pub async fn has_children(
        &self,
        path: &ObjectPath,
        cancel: &CancellationToken,
    ) -> NavResult<bool> {
        let result = match path.bucket_name() {
            None => self
                .buckets
                .list_all_buckets(cancel)
                .await
                .map(|buckets| !buckets.is_empty()),
            Some(bucket) => {
                self.index(bucket)
                    .has_children(path.trimmed_name().unwrap_or(""), cancel)
                    .await
            }
        };
        absent_is_false(result)
    }

    async fn bucket_exists(&self, bucket: &str) -> NavResult<bool> {
        if self.buckets.peek(bucket).await.is_some() {
            return Ok(true);
        }
        self.store
            .try_get_bucket(bucket)
            .await
            .map(|found| found.is_some())
            .map_err(|err| NavError::from_store(Operation::ItemExists, bucket, err))
    }

    // ---- get ----

    pub async fn get_item(&self, path: &ObjectPath, cancel: &CancellationToken) -> NavResult<Item> {
        let result = self.resolve_item(path, cancel).await;
        self.report(Operation::GetItem, result)
    }

    async fn resolve_item(&self, path: &ObjectPath, cancel: &CancellationToken) -> NavResult<Item> {
        let Some(bucket) = path.bucket_name() else {
            return Ok(Item::Drive);
        };
        let Some(name) = path.trimmed_name().filter(|name| !name.is_empty()) else {
            if let Some(cached) = self.buckets.peek(bucket).await {
                return Ok(Item::Bucket(cached));
            }
            return self
                .store
                .try_get_bucket(bucket)
                .await
                .map_err(|err| NavError::from_store(Operation::GetItem, bucket, err))?
                .map(Item::Bucket)
                .ok_or_else(|| NavError::NotFound {
                    path: path.render(),
                });
        };

        let index = self.index(bucket);
        if !path.has_folder_intent() {
            if let Some(file) = self.real_file(&index, name, cancel).await? {
                return Ok(Item::Object(file));
            }
        }
        if index.is_container(name, cancel).await? {
            return Ok(Item::Folder {
                path: path.folder_prefix(),
                marker: index.real_marker(name, cancel).await?,
            });
        }
        Err(NavError::NotFound {
            path: path.render(),
        })
    }

    /// Real, non-marker object stored at exactly `name`.
    async fn real_file(
        &self,
        index: &BucketObjectIndex,
        name: &str,
        cancel: &CancellationToken,
    ) -> NavResult<Option<ObjectMetadata>> {
        Ok(index
            .lookup(name, cancel)
            .await?
            .and_then(|entry| entry.metadata)
            .filter(|metadata| !metadata.is_marker()))
    }

    // ---- children ----

    /// Lazily enumerate the children of `path`.
    ///
    /// The drive yields buckets. A folder yields files and subfolders (one
    /// level, or every descendant when `recursive`). A plain object yields
    /// itself. Telemetry fires once the cursor finishes, fails, or is dropped.
    pub async fn child_items(
        &self,
        path: &ObjectPath,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> NavResult<ChildCursor> {
        let mut reporter =
            OnceReporter::new(self.telemetry.clone(), COMPONENT, Operation::GetChildItems);
        match self.child_source(path, recursive, cancel).await {
            Ok(ChildSource::Buckets(buckets)) => Ok(ChildCursor::buckets(buckets, reporter)),
            Ok(ChildSource::Single(object)) => Ok(ChildCursor::single(object, reporter)),
            Ok(ChildSource::Listing(lister, index)) => Ok(ChildCursor::listing(
                path.clone(),
                lister,
                index,
                recursive,
                reporter,
            )),
            Err(err) => {
                reporter.failure(&err);
                Err(err)
            }
        }
    }

    async fn child_source(
        &self,
        path: &ObjectPath,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> NavResult<ChildSource> {
        Self::check_cancel(cancel, Operation::GetChildItems, path)?;
        let Some(bucket) = path.bucket_name() else {
            let buckets = self.buckets.list_all_buckets(cancel).await?;
            return Ok(ChildSource::Buckets(buckets));
        };

        let index = self.index(bucket);
        if let Some(name) = path.trimmed_name().filter(|name| !name.is_empty()) {
            if !index.is_container(name, cancel).await? {
                return self
                    .real_file(&index, name, cancel)
                    .await?
                    .map(ChildSource::Single)
                    .ok_or_else(|| NavError::NotFound {
                        path: path.render(),
                    });
            }
        }

        let lister = ObjectLister::new(
            self.store.clone(),
            bucket,
            path.folder_prefix(),
            recursive,
            self.config.page_size,
            Operation::GetChildItems,
            cancel.clone(),
        );
        Ok(ChildSource::Listing(lister, index))
    }

    /// Enumerate every child into memory.
    pub async fn collect_child_items(
        &self,
        path: &ObjectPath,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> NavResult<Vec<ChildItem>> {
        self.child_items(path, recursive, cancel)
            .await?
            .collect()
            .await
    }

    // ---- create ----

    /// Create a bucket, folder marker, or object at `path`.
    ///
    /// `content_type` defaults to UTF-8 text for text, a guess from the file
    /// extension for local files, and octet-stream for raw bytes.
    pub async fn new_item(
        &self,
        path: &ObjectPath,
        content: NewItemContent,
        content_type: Option<String>,
        cancel: &CancellationToken,
    ) -> NavResult<Item> {
        let result = self.create(path, content, content_type, cancel).await;
        self.report(Operation::NewItem, result)
    }

    async fn create(
        &self,
        path: &ObjectPath,
        content: NewItemContent,
        content_type: Option<String>,
        cancel: &CancellationToken,
    ) -> NavResult<Item> {
        Self::check_cancel(cancel, Operation::NewItem, path)?;
        let bucket = match path.kind() {
            PathKind::Drive => {
                return Err(NavError::InvalidPath {
                    path: path.render(),
                    reason: "the drive root cannot be created".into(),
                });
            }
            PathKind::Bucket => return self.create_bucket(path, &content).await,
            PathKind::Object => path.bucket_name().unwrap_or_default(),
        };

        let is_folder = matches!(content, NewItemContent::Folder);
        if !is_folder && path.has_folder_intent() {
            return Err(NavError::InvalidPath {
                path: path.render(),
                reason: "object names ending in `/` are reserved for folders".into(),
            });
        }
        let target = if is_folder { path.as_folder() } else { path.clone() };
        let name = target.object_name().unwrap_or_default();
        if name.is_empty() {
            return Err(NavError::InvalidPath {
                path: path.render(),
                reason: "an object needs a non-empty name".into(),
            });
        }

        let (body, default_type) = match content {
            NewItemContent::Folder => (Bytes::new(), None),
            NewItemContent::Text(text) => (Bytes::from(text), Some(TEXT_CONTENT_TYPE.to_string())),
            NewItemContent::Bytes(bytes) => (bytes, Some(BINARY_CONTENT_TYPE.to_string())),
            NewItemContent::File(local) => {
                let guessed = mime_guess::from_path(&local)
                    .first_or_octet_stream()
                    .to_string();
                let data = tokio::fs::read(&local).await.map_err(|err| {
                    NavError::TransferFailed {
                        path: local.display().to_string(),
                        source: StoreError::Io(err),
                    }
                })?;
                (Bytes::from(data), Some(guessed))
            }
        };

        let mut writer = self
            .content
            .open_writer(bucket, name, content_type.or(default_type))
            .with_index(self.index(bucket));
        if !body.is_empty() {
            writer.write(&body).await?;
        }
        let metadata = writer.close().await?;
        info!(path = %target, size = metadata.size, "created item");

        Ok(if is_folder {
            Item::Folder {
                path: metadata.name.clone(),
                marker: Some(metadata),
            }
        } else {
            Item::Object(metadata)
        })
    }

    async fn create_bucket(&self, path: &ObjectPath, content: &NewItemContent) -> NavResult<Item> {
        if !matches!(content, NewItemContent::Folder) {
            return Err(NavError::InvalidPath {
                path: path.render(),
                reason: "a bucket cannot hold content directly".into(),
            });
        }
        let name = path.bucket_name().unwrap_or_default();
        let bucket = self
            .store
            .insert_bucket(&self.config.default_project, name)
            .await
            .map_err(|err| NavError::from_store(Operation::NewItem, name, err))?;
        self.buckets.invalidate().await;
        info!(bucket = name, project = %self.config.default_project, "created bucket");
        Ok(Item::Bucket(bucket))
    }

    // ---- copy ----

    /// Copy `src` to `dst`.
    ///
    /// A single object lands at `dst`, or inside it when `dst` is a bucket,
    /// ends with `/`, or is an existing folder. With `recurse`, every
    /// descendant of a folder is copied to the same relative path under
    /// `dst`. Children already copied when one fails are left in place.
    pub async fn copy_item(
        &self,
        src: &ObjectPath,
        dst: &ObjectPath,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        let result = self.copy(src, dst, recurse, cancel).await;
        self.report(Operation::CopyItem, result)
    }

    async fn copy(
        &self,
        src: &ObjectPath,
        dst: &ObjectPath,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        Self::check_cancel(cancel, Operation::CopyItem, src)?;
        let (Some(src_bucket), Some(dst_bucket)) = (src.bucket_name(), dst.bucket_name()) else {
            return Err(NavError::InvalidPath {
                path: format!("{src} -> {dst}"),
                reason: "copy needs a bucket on both sides".into(),
            });
        };
        let src_index = self.index(src_bucket);
        let src_name = src.trimmed_name().unwrap_or("");

        if !src_name.is_empty() && !src.has_folder_intent() {
            if let Some(file) = self.real_file(&src_index, src_name, cancel).await? {
                let dst_name = self.single_copy_target(dst, src.leaf(), cancel).await?;
                return self.copy_one(&file, dst_bucket, &dst_name).await.map(|_| ());
            }
        }

        let is_container =
            src_name.is_empty() || src_index.is_container(src_name, cancel).await?;
        if !is_container {
            return Err(NavError::NotFound {
                path: src.render(),
            });
        }
        if !recurse {
            return Err(NavError::InvalidPath {
                path: src.render(),
                reason: "is a folder; copy it recursively".into(),
            });
        }

        let src_prefix = src.folder_prefix();
        let dst_prefix = dst.folder_prefix();
        let descendants = self
            .list_descendants(src_bucket, &src_prefix, Operation::CopyItem, cancel)
            .await?;
        debug!(src = %src, dst = %dst, count = descendants.len(), "recursive copy");

        let store = self.store.clone();
        let (src_bucket_owned, dst_bucket_owned) = (src_bucket.to_string(), dst_bucket.to_string());
        let prefixes = (src_prefix.clone(), dst_prefix.clone());
        let outcome = self
            .fan_out(
                Operation::CopyItem,
                src,
                descendants.into_iter().filter(|name| *name != src_prefix).collect(),
                cancel,
                move |name: String| {
                    let store = store.clone();
                    let request = CopyObjectRequest {
                        src_bucket: src_bucket_owned.clone(),
                        dst_bucket: dst_bucket_owned.clone(),
                        dst_name: format!("{}{}", prefixes.1, &name[prefixes.0.len()..]),
                        src_name: name,
                        ..Default::default()
                    };
                    async move {
                        match store.copy_object(request.clone()).await {
                            Ok(_) => Ok(()),
                            // Deleted since it was listed.
                            Err(err) if err.is_not_found() => Ok(()),
                            Err(err) => Err(NavError::from_store(
                                Operation::CopyItem,
                                object_location(&request.src_bucket, &request.src_name),
                                err,
                            )),
                        }
                    }
                },
            )
            .await;

        let outcome = match outcome {
            Ok(_) if src_name.is_empty() || dst_prefix.is_empty() => Ok(()),
            Ok(_) => match src_index.real_marker(src_name, cancel).await {
                Ok(Some(marker)) => self
                    .copy_one(&marker, dst_bucket, &dst_prefix)
                    .await
                    .map(|_| ()),
                Ok(None) => Ok(()),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        self.index(dst_bucket).invalidate().await;
        outcome
    }

    /// Destination object name for copying one object named `leaf` to `dst`.
    async fn single_copy_target(
        &self,
        dst: &ObjectPath,
        leaf: &str,
        cancel: &CancellationToken,
    ) -> NavResult<String> {
        let into_folder = match (dst.bucket_name(), dst.trimmed_name()) {
            (Some(_), None) => true,
            (Some(_), Some(_)) if dst.has_folder_intent() => true,
            (Some(bucket), Some(name)) => self.index(bucket).is_container(name, cancel).await?,
            (None, _) => false,
        };
        Ok(if into_folder {
            format!("{}{leaf}", dst.folder_prefix())
        } else {
            dst.object_name().unwrap_or(leaf).to_string()
        })
    }

    async fn copy_one(
        &self,
        source: &ObjectMetadata,
        dst_bucket: &str,
        dst_name: &str,
    ) -> NavResult<ObjectMetadata> {
        let copied = self
            .store
            .copy_object(CopyObjectRequest {
                src_bucket: source.bucket.clone(),
                src_name: source.name.clone(),
                dst_bucket: dst_bucket.to_string(),
                dst_name: dst_name.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|err| {
                NavError::from_store(
                    Operation::CopyItem,
                    object_location(&source.bucket, &source.name),
                    err,
                )
            })?;
        self.index(dst_bucket).insert(copied.clone()).await;
        debug!(
            src = %object_location(&source.bucket, &source.name),
            dst = %object_location(dst_bucket, dst_name),
            "copied object"
        );
        Ok(copied)
    }

    // ---- remove ----

    /// Remove `path`.
    ///
    /// A file is deleted outright. A folder or bucket with children needs
    /// `recurse`; its descendants are deleted concurrently, then its marker
    /// or the bucket itself. Children deleted before a failure stay deleted.
    pub async fn remove_item(
        &self,
        path: &ObjectPath,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        let result = self.remove(path, recurse, cancel).await;
        self.report(Operation::RemoveItem, result)
    }

    async fn remove(
        &self,
        path: &ObjectPath,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        Self::check_cancel(cancel, Operation::RemoveItem, path)?;
        let Some(bucket) = path.bucket_name() else {
            return Err(NavError::InvalidPath {
                path: path.render(),
                reason: "the drive root cannot be removed".into(),
            });
        };
        let index = self.index(bucket);
        let result = match path.trimmed_name().filter(|name| !name.is_empty()) {
            None => self.remove_bucket(path, bucket, recurse, cancel).await,
            Some(name) => self.remove_object(path, &index, name, recurse, cancel).await,
        };
        index.invalidate().await;
        result
    }

    async fn remove_object(
        &self,
        path: &ObjectPath,
        index: &BucketObjectIndex,
        name: &str,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        let bucket = index.bucket();
        if !path.has_folder_intent() {
            if let Some(file) = self.real_file(index, name, cancel).await? {
                return self.delete_one(bucket, &file.name).await;
            }
        }
        if !index.is_container(name, cancel).await? {
            return Err(NavError::NotFound {
                path: path.render(),
            });
        }

        let prefix = path.folder_prefix();
        if index.has_children(name, cancel).await? {
            if !recurse {
                return Err(NavError::NotEmpty {
                    path: path.render(),
                });
            }
            self.delete_descendants(path, bucket, &prefix, cancel).await?;
        }
        match self.delete_one(bucket, &prefix).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn remove_bucket(
        &self,
        path: &ObjectPath,
        bucket: &str,
        recurse: bool,
        cancel: &CancellationToken,
    ) -> NavResult<()> {
        if self.index(bucket).has_children("", cancel).await? {
            if !recurse {
                return Err(NavError::NotEmpty {
                    path: path.render(),
                });
            }
            self.delete_descendants(path, bucket, "", cancel).await?;
        }
        let deleted = self
            .store
            .delete_bucket(bucket)
            .await
            .map_err(|err| NavError::from_store(Operation::RemoveItem, bucket, err));
        self.buckets.invalidate().await;
        self.indexes.remove(bucket);
        deleted?;
        info!(bucket, "removed bucket");
        Ok(())
    }

    /// Delete every object under `prefix` except the folder's own marker.
    async fn delete_descendants(
        &self,
        path: &ObjectPath,
        bucket: &str,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> NavResult<usize> {
        let names: Vec<String> = self
            .list_descendants(bucket, prefix, Operation::RemoveItem, cancel)
            .await?
            .into_iter()
            .filter(|name| name != prefix)
            .collect();
        debug!(path = %path, count = names.len(), "recursive delete");

        let store = self.store.clone();
        let bucket = bucket.to_string();
        self.fan_out(Operation::RemoveItem, path, names, cancel, move |name: String| {
            let store = store.clone();
            let bucket = bucket.clone();
            async move {
                match store.delete_object(&bucket, &name).await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => Ok(()),
                    Err(err) => Err(NavError::from_store(
                        Operation::RemoveItem,
                        object_location(&bucket, &name),
                        err,
                    )),
                }
            }
        })
        .await
    }

    async fn delete_one(&self, bucket: &str, name: &str) -> NavResult<()> {
        self.store
            .delete_object(bucket, name)
            .await
            .map_err(|err| {
                NavError::from_store(Operation::RemoveItem, object_location(bucket, name), err)
            })?;
        debug!(bucket, name, "deleted object");
        Ok(())
    }

    async fn list_descendants(
        &self,
        bucket: &str,
        prefix: &str,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> NavResult<Vec<String>> {
        let mut lister = ObjectLister::new(
            self.store.clone(),
            bucket,
            prefix,
            true,
            self.config.page_size,
            operation,
            cancel.clone(),
        );
        let mut names = Vec::new();
        while let Some(page) = lister.next_page().await? {
            names.extend(page.items.into_iter().map(|object| object.name));
        }
        Ok(names)
    }

    /// Run `job` for every name, at most `max_concurrency` at a time.
    ///
    /// After the first failure (or cancellation) no new job starts, but jobs
    /// already running are awaited. Returns the number of completed jobs.
    async fn fan_out<F, Fut>(
        &self,
        operation: Operation,
        parent: &ObjectPath,
        names: Vec<String>,
        cancel: &CancellationToken,
        job: F,
    ) -> NavResult<usize>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = NavResult<()>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let total = names.len();
        let mut started = 0usize;
        let mut completed = 0usize;
        let mut failure: Option<(String, NavError)> = None;

        let mut settle = |joined: Result<(String, NavResult<()>), tokio::task::JoinError>,
                          failure: &mut Option<(String, NavError)>| {
            match joined {
                Ok((_, Ok(()))) => completed += 1,
                Ok((name, Err(err))) => {
                    failure.get_or_insert((name, err));
                }
                Err(err) => {
                    failure.get_or_insert((
                        String::new(),
                        NavError::Store {
                            operation,
                            path: parent.render(),
                            source: StoreError::Backend(format!("task failed: {err}")),
                        },
                    ));
                }
            }
        };

        for name in names {
            while let Some(joined) = tasks.try_join_next() {
                settle(joined, &mut failure);
            }
            if failure.is_some() || cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => permit,
                _ = cancel.cancelled() => break,
            };
            let Ok(permit) = permit else { break };
            while let Some(joined) = tasks.try_join_next() {
                settle(joined, &mut failure);
            }
            if failure.is_some() {
                break;
            }
            let work = job(name.clone());
            started += 1;
            tasks.spawn(async move {
                let result = work.await;
                drop(permit);
                (name, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            settle(joined, &mut failure);
        }

        if let Some((name, err)) = failure {
            let child = parent
                .bucket_name()
                .map(|bucket| object_location(bucket, &name))
                .unwrap_or(name);
            return Err(NavError::Recursive {
                operation,
                path: child,
                completed,
                skipped: total - started,
                source: Box::new(err),
            });
        }
        if cancel.is_cancelled() {
            return Err(NavError::cancelled(operation, parent.render()));
        }
        Ok(completed)
    }

    // ---- content ----

    /// Open the payload of the object at `path` for reading.
    pub async fn open_reader(
        &self,
        path: &ObjectPath,
        cancel: &CancellationToken,
    ) -> NavResult<ContentReader> {
        let result = async {
            Self::check_cancel(cancel, Operation::GetContentReader, path)?;
            let (bucket, name) = content_target(path)?;
            self.content.open_reader(bucket, name).await
        }
        .await;
        self.report(Operation::GetContentReader, result)
    }

    /// Open a writer that replaces the object at `path` once closed.
    pub async fn open_writer(
        &self,
        path: &ObjectPath,
        content_type: Option<String>,
        cancel: &CancellationToken,
    ) -> NavResult<ContentWriter> {
        let result = Self::check_cancel(cancel, Operation::GetContentWriter, path)
            .and_then(|_| content_target(path))
            .map(|(bucket, name)| {
                self.content
                    .open_writer(bucket, name, content_type)
                    .with_index(self.index(bucket))
            });
        self.report(Operation::GetContentWriter, result)
    }

    /// Truncate the existing object at `path` to zero bytes, keeping its
    /// content type.
    pub async fn clear_content(
        &self,
        path: &ObjectPath,
        cancel: &CancellationToken,
    ) -> NavResult<ObjectMetadata> {
        let result = async {
            Self::check_cancel(cancel, Operation::ClearContent, path)?;
            let (bucket, name) = content_target(path)?;
            let index = self.index(bucket);
            let existing = self
                .real_file(&index, name, cancel)
                .await?
                .ok_or_else(|| NavError::NotFound {
                    path: path.render(),
                })?;
            let cleared = self
                .content
                .clear(bucket, name, existing.content_type)
                .await?;
            index.insert(cleared.clone()).await;
            Ok::<_, NavError>(cleared)
        }
        .await;
        self.report(Operation::ClearContent, result)
    }
}

/// Bucket and object name for a byte-level operation on `path`.
fn content_target(path: &ObjectPath) -> NavResult<(&str, &str)> {
    match (path.bucket_name(), path.object_name()) {
        (Some(bucket), Some(name)) if !path.has_folder_intent() => Ok((bucket, name)),
        _ => Err(NavError::InvalidPath {
            path: path.render(),
            reason: "content is only available on objects".into(),
        }),
    }
}

fn absent_is_false(result: NavResult<bool>) -> NavResult<bool> {
    match result {
        Err(err) if err.is_not_found() => Ok(false),
        other => other,
    }
}
