//! Buckets and the projects that own them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A top-level container for objects.
///
/// Bucket names are global across projects.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct BucketMetadata {
    /// Globally unique bucket name.
    pub name: String,

    /// Project the bucket is billed to.
    pub project: String,

    /// Location the bucket is hosted in (e.g. "us-west1").
    pub location: String,

    /// Default storage class for new objects.
    pub storage_class: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}

/// A project visible to the caller.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
}
