//! Browse a flat bucket/object store as a drive of buckets and folders.
//!
//! [`NavigationEngine`] is the entry point. It drives any
//! [`ObjectStoreClient`]; [`MemoryStore`] and [`SqliteStore`] ship with the
//! crate.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod shell;
pub mod store;
pub mod telemetry;

pub use config::{AppConfig, Backend, NavigatorConfig};
pub use errors::{NavError, NavResult, Operation, StoreError, StoreResult};
pub use models::{BucketMetadata, ChildItem, Item, ObjectMetadata, ObjectPath, PathKind};
pub use services::{
    children::ChildCursor,
    content_stream::{ContentReader, ContentWriter},
    navigation::{NavigationEngine, NewItemContent},
};
pub use store::{MemoryStore, ObjectStoreClient, ObjectStoreClientExt, SqliteStore};
pub use telemetry::{Telemetry, TracingTelemetry};
pub use tokio_util::sync::CancellationToken;
