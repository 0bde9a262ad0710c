//! Durable local object store backed by SQLite for metadata
//! and local disk for object payloads.
//!
//! Payloads are sharded beneath `base_path/{bucket}/{shard}/{shard}/{digest}`
//! where `digest` is the MD5 of the object key, so marker keys ending in `/`
//! and keys nested beneath them never collide on disk.

use super::{
    BucketPage, ByteStream, CopyObjectRequest, InsertObjectRequest, ListObjectsParams,
    ObjectPage, ObjectStoreClient, ProjectPage, compute_common_prefix,
};
use crate::{
    errors::{StoreError, StoreResult},
    models::{BucketMetadata, ObjectMetadata, Project},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use sqlx::{
    FromRow, QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_LOCATION: &str = "local";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "b.name AS bucket, o.key, o.content_type, o.size_bytes, \
     o.etag, o.generation, o.storage_class, o.last_modified, o.metadata";

#[derive(FromRow)]
struct BucketRow {
    id: Uuid,
    name: String,
}

#[derive(FromRow)]
struct ObjectRow {
    bucket: String,
    key: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: Option<String>,
    generation: i64,
    storage_class: String,
    last_modified: DateTime<Utc>,
    metadata: String,
}

impl ObjectRow {
    fn into_metadata(self, payload: &Path) -> ObjectMetadata {
        ObjectMetadata {
            media_link: Some(format!("file://{}", payload.display())),
            bucket: self.bucket,
            name: self.key,
            size: u64::try_from(self.size_bytes).unwrap_or(0),
            content_type: self.content_type,
            etag: self.etag,
            generation: self.generation,
            storage_class: self.storage_class,
            updated: self.last_modified,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
        }
    }
}

/// Local [`ObjectStoreClient`].
///
/// Deletes are soft in SQLite (`is_deleted = 1`) with best-effort payload
/// removal; overwrites upsert the metadata row and bump the generation.
#[derive(Clone)]
pub struct SqliteStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Open (creating if missing) the database at `database_url` and make
    /// sure the payload directory exists.
    pub async fn connect(database_url: &str, base_path: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).await?;
            info!("Created storage directory at {}", base_path.display());
        }

        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("file:");
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                info!("Created missing directory {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        debug!("Connected to {}", database_url);

        Ok(Self::new(Arc::new(pool), base_path))
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Payload location for `key`: two MD5-derived shard levels, then the
    /// full digest as file name.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let digest = format!("{:x}", md5::compute(format!("{bucket_name}/{key}")));
        let mut path = self.bucket_root(bucket_name);
        path.push(&digest[0..2]);
        path.push(&digest[2..4]);
        path.push(&digest);
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StoreResult<BucketRow> {
        sqlx::query_as::<Sqlite, BucketRow>("SELECT id, name FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("bucket {bucket}")))
    }

    async fn fetch_object(&self, bucket: &BucketRow, key: &str) -> StoreResult<ObjectMetadata> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects o JOIN buckets b ON b.id = o.bucket_id \
             WHERE o.key = ? AND o.bucket_id = ? AND o.is_deleted = 0"
        );
        let row = sqlx::query_as::<Sqlite, ObjectRow>(&sql)
            .bind(key)
            .bind(bucket.id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("object {}/{key}", bucket.name)))?;
        Ok(row.into_metadata(&self.object_path(&bucket.name, key)))
    }

    /// Upsert the metadata row for a freshly written payload.
    async fn upsert_object(
        &self,
        bucket: &BucketRow,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: String,
        metadata: BTreeMap<String, String>,
    ) -> StoreResult<ObjectMetadata> {
        let updated = Utc::now();
        let generation = updated.timestamp_micros();
        let metadata_json =
            serde_json::to_string(&metadata).map_err(|err| StoreError::Backend(err.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag,
                generation, storage_class, last_modified, metadata, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                generation = excluded.generation,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified,
                metadata = excluded.metadata,
                is_deleted = 0
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(key)
        .bind(content_type.clone())
        .bind(size_bytes)
        .bind(&etag)
        .bind(generation)
        .bind(DEFAULT_STORAGE_CLASS)
        .bind(updated)
        .bind(metadata_json)
        .execute(&*self.db)
        .await?;

        Ok(ObjectMetadata {
            bucket: bucket.name.clone(),
            name: key.to_string(),
            size: u64::try_from(size_bytes).unwrap_or(0),
            content_type,
            etag: Some(etag),
            generation,
            storage_class: DEFAULT_STORAGE_CLASS.into(),
            updated,
            media_link: Some(format!(
                "file://{}",
                self.object_path(&bucket.name, key).display()
            )),
            metadata,
        })
    }

    /// Move a completed temp file into place, replacing any previous payload.
    async fn commit_payload(tmp_path: &Path, file_path: &Path) -> StoreResult<()> {
        if let Err(err) = fs::rename(tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        Ok(())
    }

    async fn temp_path_for(file_path: &Path) -> StoreResult<PathBuf> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        Ok(parent.join(format!(".tmp-{}", Uuid::new_v4())))
    }

    /// Recursively remove empty directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Rejects empty, oversized, absolute, traversal and control-character keys.
fn ensure_key_safe(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.split('/').any(|segment| segment == "..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(StoreError::InvalidArgument(format!("invalid object key `{key}`")));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens, underscores only
/// - must start and end with a letter or digit
/// - cannot contain consecutive dots
fn ensure_bucket_name_safe(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| {
        Err(StoreError::InvalidArgument(format!(
            "bucket `{name}` invalid: {reason}"
        )))
    };

    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, hyphens and underscores");
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") {
        return invalid("cannot contain consecutive dots");
    }
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn encode_page_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_page_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[async_trait]
impl ObjectStoreClient for SqliteStore {
    /// Lexicographic listing with prefix filtering, delimiter grouping and
    /// base64 page tokens carrying the last key returned.
    async fn list_objects(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> StoreResult<ObjectPage> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let page_size = params.page_size();
        let fetch_limit = page_size + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects o JOIN buckets b ON b.id = o.bucket_id \
             WHERE o.bucket_id = "
        ));
        builder.push_bind(bucket_rec.id);
        builder.push(" AND o.is_deleted = 0");

        if let Some(prefix) = params.prefix.as_deref().filter(|p| !p.is_empty()) {
            builder.push(" AND substr(o.key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.to_string());
        }

        if let Some(token) = params.page_token.as_deref() {
            builder.push(" AND o.key > ");
            builder.push_bind(decode_page_token(token));
        }

        builder.push(" ORDER BY o.key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_page_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_page_token = rows.last().map(|last| encode_page_token(&last.key));
        }

        let mut items = Vec::new();
        let mut prefixes = BTreeSet::new();
        for row in rows {
            if let Some(delimiter) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&row.key, params.prefix.as_deref(), delimiter)
                {
                    prefixes.insert(prefix);
                    continue;
                }
            }
            let payload = self.object_path(&bucket_rec.name, &row.key);
            items.push(row.into_metadata(&payload));
        }

        Ok(ObjectPage {
            items,
            prefixes: prefixes.into_iter().collect(),
            next_page_token,
        })
    }

    async fn get_object(&self, bucket: &str, name: &str) -> StoreResult<ObjectMetadata> {
        ensure_key_safe(name)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, name).await
    }

    async fn open_download(&self, object: &ObjectMetadata) -> StoreResult<ByteStream> {
        let bucket_rec = self.fetch_bucket(&object.bucket).await?;
        let current = self.fetch_object(&bucket_rec, &object.name).await?;
        let file_path = self.object_path(&bucket_rec.name, &current.name);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(format!("object {}/{}", object.bucket, object.name))
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    /// Stream the body to a temp file while computing size and MD5, then
    /// rename into place and upsert the metadata row.
    async fn insert_object(
        &self,
        request: InsertObjectRequest,
        mut body: ByteStream,
    ) -> StoreResult<ObjectMetadata> {
        ensure_key_safe(&request.name)?;
        let bucket_rec = self.fetch_bucket(&request.bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, &request.name);
        let tmp_path = Self::temp_path_for(&file_path).await?;
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Self::commit_payload(&tmp_path, &file_path).await?;

        let etag = format!("{:x}", digest.compute());
        match self
            .upsert_object(
                &bucket_rec,
                &request.name,
                request.content_type,
                size_bytes,
                etag,
                request.metadata,
            )
            .await
        {
            Ok(object) => Ok(object),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(err)
            }
        }
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<ObjectMetadata> {
        ensure_key_safe(&request.src_name)?;
        ensure_key_safe(&request.dst_name)?;
        let src_bucket = self.fetch_bucket(&request.src_bucket).await?;
        let dst_bucket = self.fetch_bucket(&request.dst_bucket).await?;
        let source = self.fetch_object(&src_bucket, &request.src_name).await?;
        if let Some(generation) = request.source_generation {
            if generation != source.generation {
                return Err(StoreError::NotFound(format!(
                    "object {}/{} generation {generation}",
                    request.src_bucket, request.src_name
                )));
            }
        }

        let src_path = self.object_path(&src_bucket.name, &request.src_name);
        let dst_path = self.object_path(&dst_bucket.name, &request.dst_name);
        let tmp_path = Self::temp_path_for(&dst_path).await?;
        if let Err(err) = fs::copy(&src_path, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Self::commit_payload(&tmp_path, &dst_path).await?;

        self.upsert_object(
            &dst_bucket,
            &request.dst_name,
            request.content_type.or(source.content_type),
            i64::try_from(source.size).unwrap_or(i64::MAX),
            source.etag.unwrap_or_default(),
            request.metadata.unwrap_or(source.metadata),
        )
        .await
    }

    /// Soft-delete the row, then remove the payload and prune empty shard
    /// directories.
    async fn delete_object(&self, bucket: &str, name: &str) -> StoreResult<()> {
        ensure_key_safe(name)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let result = sqlx::query(
            "UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(name)
        .bind(bucket_rec.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("object {bucket}/{name}")));
        }

        let file_path = self.object_path(&bucket_rec.name, name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn list_projects(&self, page_token: Option<String>) -> StoreResult<ProjectPage> {
        let fetch_limit = super::MAX_PAGE_SIZE + 1;
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT id, name FROM projects");
        if let Some(token) = page_token.as_deref() {
            builder.push(" WHERE id > ");
            builder.push_bind(decode_page_token(token));
        }
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut projects: Vec<Project> = builder.build_query_as().fetch_all(&*self.db).await?;
        let mut next_page_token = None;
        if projects.len() == fetch_limit {
            projects.pop();
            next_page_token = projects.last().map(|p| encode_page_token(&p.id));
        }
        Ok(ProjectPage {
            projects,
            next_page_token,
        })
    }

    async fn list_buckets(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> StoreResult<BucketPage> {
        let fetch_limit = super::MAX_PAGE_SIZE + 1;
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT name, project, location, storage_class, created_at FROM buckets WHERE project = ",
        );
        builder.push_bind(project.to_string());
        if let Some(token) = page_token.as_deref() {
            builder.push(" AND name > ");
            builder.push_bind(decode_page_token(token));
        }
        builder.push(" ORDER BY name ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut buckets: Vec<BucketMetadata> =
            builder.build_query_as().fetch_all(&*self.db).await?;
        let mut next_page_token = None;
        if buckets.len() == fetch_limit {
            buckets.pop();
            next_page_token = buckets.last().map(|b| encode_page_token(&b.name));
        }
        Ok(BucketPage {
            buckets,
            next_page_token,
        })
    }

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketMetadata> {
        sqlx::query_as::<Sqlite, BucketMetadata>(
            "SELECT name, project, location, storage_class, created_at FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("bucket {name}")))
    }

    /// Create a bucket (and its project row on first use) and its payload
    /// directory.
    async fn insert_bucket(&self, project: &str, name: &str) -> StoreResult<BucketMetadata> {
        ensure_bucket_name_safe(name)?;

        sqlx::query("INSERT OR IGNORE INTO projects (id, name) VALUES (?, ?)")
            .bind(project)
            .bind(project)
            .execute(&*self.db)
            .await?;

        let bucket = BucketMetadata {
            name: name.to_string(),
            project: project.to_string(),
            location: DEFAULT_LOCATION.into(),
            storage_class: DEFAULT_STORAGE_CLASS.into(),
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, project, location, storage_class, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(&bucket.name)
        .bind(&bucket.project)
        .bind(&bucket.location)
        .bind(&bucket.storage_class)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::AlreadyExists(format!("bucket {name}")));
            }
            Err(err) => return Err(StoreError::Sqlx(err)),
        }

        fs::create_dir_all(self.bucket_root(name)).await?;
        Ok(bucket)
    }

    async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        let bucket_rec = self.fetch_bucket(name).await?;
        let live: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM objects WHERE bucket_id = ? AND is_deleted = 0",
        )
        .bind(bucket_rec.id)
        .fetch_one(&*self.db)
        .await?;
        if live > 0 {
            return Err(StoreError::InvalidArgument(format!(
                "bucket {name} is not empty"
            )));
        }

        sqlx::query("DELETE FROM objects WHERE bucket_id = ?")
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta/drive.db").display());
        let store = SqliteStore::connect(&url, dir.path().join("objects"))
            .await
            .unwrap();
        store.run_migrations().await.unwrap();
        (dir, store)
    }

    fn body(data: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn put(store: &SqliteStore, bucket: &str, name: &str, data: &'static [u8]) {
        store
            .insert_object(
                InsertObjectRequest {
                    bucket: bucket.into(),
                    name: name.into(),
                    ..Default::default()
                },
                body(data),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_should_store_and_read_back_object() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("proj", "photos").await.unwrap();
        put(&store, "photos", "2025/img.jpg", b"jpeg").await;

        let meta = store.get_object("photos", "2025/img.jpg").await.unwrap();
        assert_eq!(meta.size, 4);
        assert_eq!(meta.etag.as_deref(), Some(format!("{:x}", md5::compute(b"jpeg")).as_str()));

        let mut stream = store.open_download(&meta).await.unwrap();
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(data, b"jpeg");
    }

    #[tokio::test]
    async fn test_should_store_marker_and_nested_key_side_by_side() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("proj", "docs").await.unwrap();
        put(&store, "docs", "dir/", b"").await;
        put(&store, "docs", "dir/y.txt", b"y").await;

        let page = store
            .list_objects(
                "docs",
                &ListObjectsParams {
                    prefix: Some("dir/".into()),
                    delimiter: Some("/".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["dir/", "dir/y.txt"]);
    }

    #[tokio::test]
    async fn test_should_page_with_base64_tokens() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("proj", "many").await.unwrap();
        for name in ["a", "b", "c"] {
            put(&store, "many", name, b"-").await;
        }
        let first = store
            .list_objects(
                "many",
                &ListObjectsParams {
                    max_results: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.next_page_token.unwrap();
        assert_eq!(decode_page_token(&token), "b");

        let second = store
            .list_objects(
                "many",
                &ListObjectsParams {
                    max_results: 2,
                    page_token: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_should_soft_delete_and_report_not_found() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("proj", "tmp-bucket").await.unwrap();
        put(&store, "tmp-bucket", "x", b"x").await;
        store.delete_object("tmp-bucket", "x").await.unwrap();
        assert!(store.get_object("tmp-bucket", "x").await.unwrap_err().is_not_found());
        assert!(store.delete_object("tmp-bucket", "x").await.unwrap_err().is_not_found());
        store.delete_bucket("tmp-bucket").await.unwrap();
    }

    #[tokio::test]
    async fn test_should_copy_between_buckets() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("proj", "src").await.unwrap();
        store.insert_bucket("proj", "dst").await.unwrap();
        put(&store, "src", "a.txt", b"abc").await;

        let copied = store
            .copy_object(CopyObjectRequest {
                src_bucket: "src".into(),
                src_name: "a.txt".into(),
                dst_bucket: "dst".into(),
                dst_name: "b.txt".into(),
                content_type: Some("text/plain".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(copied.size, 3);
        assert_eq!(copied.content_type.as_deref(), Some("text/plain"));
        assert!(store.get_object("src", "a.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_should_list_projects_and_buckets() {
        let (_dir, store) = open_store().await;
        store.insert_bucket("alpha", "one").await.unwrap();
        store.insert_bucket("beta", "two").await.unwrap();
        let err = store.insert_bucket("beta", "two").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let projects = store.list_projects(None).await.unwrap();
        assert_eq!(projects.projects.len(), 2);
        let buckets = store.list_buckets("beta", None).await.unwrap();
        assert_eq!(buckets.buckets.len(), 1);
        assert_eq!(buckets.buckets[0].name, "two");
    }

    #[test]
    fn test_should_reject_unsafe_names() {
        assert!(ensure_key_safe("../etc/passwd").is_err());
        assert!(ensure_key_safe("/abs").is_err());
        assert!(ensure_key_safe("dir/").is_ok());
        assert!(ensure_bucket_name_safe("ab").is_err());
        assert!(ensure_bucket_name_safe("Upper").is_err());
        assert!(ensure_bucket_name_safe("my-bucket").is_ok());
    }
}
