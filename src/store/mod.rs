//! The object store collaborator.
//!
//! [`ObjectStoreClient`] is the networked store the navigation layer drives:
//! flat buckets of named objects, listed by prefix and delimiter with page
//! tokens. Two backends ship with the crate: [`memory::MemoryStore`] and
//! [`sqlite::SqliteStore`].

pub mod memory;
pub mod sqlite;

use crate::{
    errors::StoreResult,
    models::{BucketMetadata, ObjectMetadata, Project},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{collections::BTreeMap, io};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Pull-style payload stream used for both uploads and downloads.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Upper bound on page size a backend will honour.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub page_token: Option<String>,
    /// Zero means the backend default.
    pub max_results: usize,
}

impl ListObjectsParams {
    pub fn page_size(&self) -> usize {
        match self.max_results {
            0 => MAX_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }
}

/// One page of an object listing.
///
/// `prefixes` holds the common prefixes collapsed by the delimiter. The same
/// prefix may be reported again on a later page.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub items: Vec<ObjectMetadata>,
    pub prefixes: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct BucketPage {
    pub buckets: Vec<BucketMetadata>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Default)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    pub next_page_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct InsertObjectRequest {
    pub bucket: String,
    pub name: String,
    pub content_type: Option<String>,
    pub predefined_acl: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Server-side copy. Source metadata is preserved unless overridden.
#[derive(Clone, Debug, Default)]
pub struct CopyObjectRequest {
    pub src_bucket: String,
    pub src_name: String,
    pub dst_bucket: String,
    pub dst_name: String,
    pub source_generation: Option<i64>,
    pub destination_acl: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Object store operations required by the navigation layer.
///
/// Absence is reported as [`StoreError::NotFound`](crate::errors::StoreError::NotFound);
/// use [`ObjectStoreClientExt`] for optional lookups.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn list_objects(&self, bucket: &str, params: &ListObjectsParams)
    -> StoreResult<ObjectPage>;

    async fn get_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectMetadata>;

    /// Open the payload behind `object` for reading.
    async fn open_download(&self, object: &ObjectMetadata) -> StoreResult<ByteStream>;

    /// Upload `body`, pulling from it until EOF.
    async fn insert_object(
        &self,
        request: InsertObjectRequest,
        body: ByteStream,
    ) -> StoreResult<ObjectMetadata>;

    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<ObjectMetadata>;

    async fn delete_object(&self, bucket: &str, name: &str) -> StoreResult<()>;

    async fn list_projects(&self, page_token: Option<String>) -> StoreResult<ProjectPage>;

    async fn list_buckets(&self, project: &str, page_token: Option<String>)
    -> StoreResult<BucketPage>;

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketMetadata>;

    async fn insert_bucket(&self, project: &str, name: &str) -> StoreResult<BucketMetadata>;

    async fn delete_bucket(&self, name: &str) -> StoreResult<()>;
}

/// Optional lookups: the transport's not-found maps to `None`.
#[async_trait]
pub trait ObjectStoreClientExt: ObjectStoreClient {
    async fn try_get_object(&self, bucket: &str, name: &str) -> StoreResult<Option<ObjectMetadata>> {
        match self.get_object(bucket, name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn try_get_bucket(&self, name: &str) -> StoreResult<Option<BucketMetadata>> {
        match self.get_bucket(name).await {
            Ok(bucket) => Ok(Some(bucket)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<T: ObjectStoreClient + ?Sized> ObjectStoreClientExt for T {}

/// Compute the "common prefix" a key collapses into under delimiter listing.
///
/// Returns `Some(prefix)` if the key belongs to a grouped prefix, otherwise
/// `None` (the key is listed as an item).
pub(crate) fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let prefix = requested_prefix.unwrap_or("");
    let after_prefix = key.strip_prefix(prefix)?;
    let pos = after_prefix.find(delimiter)?;
    Some(format!("{prefix}{}", &after_prefix[..pos + delimiter.len()]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_group_keys_under_common_prefix() {
        assert_eq!(
            compute_common_prefix("dir/y.txt", None, "/"),
            Some("dir/".to_string())
        );
        assert_eq!(
            compute_common_prefix("dir/sub/y.txt", Some("dir/"), "/"),
            Some("dir/sub/".to_string())
        );
        assert_eq!(compute_common_prefix("x.txt", None, "/"), None);
    }

    #[test]
    fn test_should_list_marker_itself_as_item() {
        assert_eq!(compute_common_prefix("dir/", Some("dir/"), "/"), None);
    }

    #[test]
    fn test_should_clamp_page_size() {
        let params = ListObjectsParams {
            max_results: 5000,
            ..Default::default()
        };
        assert_eq!(params.page_size(), MAX_PAGE_SIZE);
        assert_eq!(ListObjectsParams::default().page_size(), MAX_PAGE_SIZE);
    }
}
