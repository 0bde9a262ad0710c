//! Core data models for navigating an object store as a drive.
//!
//! Buckets and objects mirror what the store reports; paths and items are
//! the hierarchical view layered on top.

pub mod bucket;
pub mod object;
pub mod path;

pub use bucket::{BucketMetadata, Project};
pub use object::{ChildItem, IndexedObject, Item, ObjectMetadata};
pub use path::{ObjectPath, PathKind};
