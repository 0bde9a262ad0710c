//! Object metadata as reported by the store, and the navigation views built on it.

use crate::models::{bucket::BucketMetadata, path::ObjectPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata for a single object (blob) within a bucket.
///
/// The payload is never held here; readers go through the content bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectMetadata {
    /// Bucket that owns the object.
    pub bucket: String,

    /// Full object name within the bucket, `/` separated.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// MD5 of the payload, hex encoded.
    pub etag: Option<String>,

    /// Monotonic generation; bumps on every overwrite.
    pub generation: i64,

    /// Storage class (e.g. STANDARD, NEARLINE).
    pub storage_class: String,

    /// Timestamp of the last write.
    pub updated: DateTime<Utc>,

    /// Direct download locator, when the backend hands one out.
    pub media_link: Option<String>,

    /// User-defined key/value metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Whether this is a folder marker (name ends with the delimiter).
    pub fn is_marker(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn path(&self) -> ObjectPath {
        ObjectPath::object(self.bucket.clone(), &self.name)
    }
}

/// One entry of a bucket index.
///
/// Folders appear either as synthetic entries (inferred from a listing prefix,
/// `metadata` is `None`) or as real marker objects; both answer container
/// queries the same way.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedObject {
    pub name: String,
    pub is_container_marker: bool,
    pub metadata: Option<ObjectMetadata>,
}

impl IndexedObject {
    pub fn real(metadata: ObjectMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            is_container_marker: metadata.is_marker(),
            metadata: Some(metadata),
        }
    }

    pub fn synthetic_folder(prefix: impl Into<String>) -> Self {
        Self {
            name: prefix.into(),
            is_container_marker: true,
            metadata: None,
        }
    }

    /// Whether a real object backs this entry.
    pub fn is_real(&self) -> bool {
        self.metadata.is_some()
    }
}

/// What a path resolves to.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
    Drive,
    Bucket(BucketMetadata),
    /// A folder; `marker` is set when a real marker object backs it.
    Folder {
        path: String,
        marker: Option<ObjectMetadata>,
    },
    Object(ObjectMetadata),
}

impl Item {
    pub fn is_container(&self) -> bool {
        !matches!(self, Item::Object(_))
    }
}

/// One entry yielded by a child enumeration.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildItem {
    /// Name relative to the enumerated parent; folders keep their trailing `/`.
    pub name: String,
    pub path: ObjectPath,
    pub item: Item,
}

impl ChildItem {
    pub fn is_container(&self) -> bool {
        self.item.is_container()
    }
}
