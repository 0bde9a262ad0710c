//! Byte-level access to object payloads.
//!
//! Downloads are pull streams already, so [`ContentReader`] only adds
//! buffering for small reads. Uploads are the awkward half: the store pulls
//! from a body stream until EOF, while callers want a sink to push into.
//! [`ContentWriter`] bridges the two with an in-process duplex pipe whose far
//! end feeds an upload task; the task handle stays with the writer and is
//! joined on close so the upload's outcome always reaches the caller.

use crate::{
    errors::{NavError, NavResult, Operation, StoreError},
    models::ObjectMetadata,
    services::object_index::BucketObjectIndex,
    store::{ByteStream, InsertObjectRequest, ObjectStoreClient, ObjectStoreClientExt},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

fn transfer_failed(path: &str, source: StoreError) -> NavError {
    NavError::TransferFailed {
        path: path.to_string(),
        source,
    }
}

pub struct ContentStreamBridge {
    store: Arc<dyn ObjectStoreClient>,
}

impl ContentStreamBridge {
    pub fn new(store: Arc<dyn ObjectStoreClient>) -> Self {
        Self { store }
    }

    /// Open a forward-only reader over the payload of `bucket/name`.
    pub async fn open_reader(&self, bucket: &str, name: &str) -> NavResult<ContentReader> {
        let path = format!("{bucket}/{name}");
        let object = self
            .store
            .try_get_object(bucket, name)
            .await
            .map_err(|err| NavError::from_store(Operation::GetContentReader, &path, err))?
            .ok_or_else(|| NavError::NotFound { path: path.clone() })?;

        let stream = match self.store.open_download(&object).await {
            Ok(stream) => stream,
            Err(err) if err.is_not_found() => return Err(NavError::NotFound { path }),
            Err(err) => return Err(transfer_failed(&path, err)),
        };
        debug!(%path, size = object.size, "opened reader");
        Ok(ContentReader {
            path,
            object,
            stream,
            pending: Bytes::new(),
        })
    }

    /// Start an upload to `bucket/name` and hand back the sink feeding it.
    pub fn open_writer(
        &self,
        bucket: &str,
        name: &str,
        content_type: Option<String>,
    ) -> ContentWriter {
        let (pipe, upload_end) = tokio::io::duplex(PIPE_CAPACITY);
        let body: ByteStream = ReaderStream::new(upload_end).boxed();
        let request = InsertObjectRequest {
            bucket: bucket.to_string(),
            name: name.to_string(),
            content_type,
            ..Default::default()
        };

        let store = self.store.clone();
        let task = tokio::spawn(async move { store.insert_object(request, body).await });
        debug!(bucket, name, "started upload");

        ContentWriter {
            path: format!("{bucket}/{name}"),
            pipe: Some(pipe),
            task: Some(task),
            index: None,
        }
    }

    /// Replace the payload of `bucket/name` with zero bytes.
    pub async fn clear(
        &self,
        bucket: &str,
        name: &str,
        content_type: Option<String>,
    ) -> NavResult<ObjectMetadata> {
        self.open_writer(bucket, name, content_type).close().await
    }
}

/// Forward-only reader over one object's payload.
pub struct ContentReader {
    path: String,
    object: ObjectMetadata,
    stream: ByteStream,
    pending: Bytes,
}

impl ContentReader {
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.object
    }

    /// Next chunk as delivered by the store, `None` at EOF.
    pub async fn next_chunk(&mut self) -> NavResult<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        match self.stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(transfer_failed(&self.path, StoreError::Io(err))),
            None => Ok(None),
        }
    }

    /// Copy up to `buf.len()` bytes into `buf`; 0 means EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> NavResult<usize> {
        while self.pending.is_empty() {
            match self.next_chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        let head = self.pending.split_to(n);
        buf[..n].copy_from_slice(&head);
        Ok(n)
    }

    pub async fn read_to_end(mut self) -> NavResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.object.size as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Adapt into a tokio reader, e.g. for `tokio::io::copy`.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        let pending = (!self.pending.is_empty()).then_some(Ok(self.pending));
        StreamReader::new(stream::iter(pending).chain(self.stream))
    }
}

/// Push-style sink over a background upload.
///
/// Upload failure surfaces on the next `write` or `flush` once the upload
/// task has stopped, and always on `close`. Dropping an unclosed writer
/// aborts the upload.
pub struct ContentWriter {
    path: String,
    pipe: Option<DuplexStream>,
    task: Option<JoinHandle<Result<ObjectMetadata, StoreError>>>,
    index: Option<Arc<BucketObjectIndex>>,
}

impl ContentWriter {
    /// Record the committed object in `index` once the upload succeeds.
    pub fn with_index(mut self, index: Arc<BucketObjectIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn write(&mut self, data: &[u8]) -> NavResult<()> {
        self.check_upload().await?;
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(self.closed_error());
        };
        if let Err(err) = pipe.write_all(data).await {
            return Err(self.upload_failure(err).await);
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> NavResult<()> {
        self.check_upload().await?;
        let Some(pipe) = self.pipe.as_mut() else {
            return Err(self.closed_error());
        };
        if let Err(err) = pipe.flush().await {
            return Err(self.upload_failure(err).await);
        }
        Ok(())
    }

    /// Signal EOF, wait for the upload and return the committed metadata.
    pub async fn close(mut self) -> NavResult<ObjectMetadata> {
        if let Some(mut pipe) = self.pipe.take() {
            if let Err(err) = pipe.shutdown().await {
                debug!(path = %self.path, %err, "pipe shutdown after upload ended");
            }
        }
        let metadata = self.join_upload().await?;
        if let Some(index) = self.index.take() {
            index.insert(metadata.clone()).await;
        }
        debug!(path = %self.path, size = metadata.size, "upload committed");
        Ok(metadata)
    }

    /// Surface the upload's failure early if it has already stopped.
    async fn check_upload(&mut self) -> NavResult<()> {
        if self.task.as_ref().is_some_and(|task| task.is_finished()) {
            self.pipe = None;
            return match self.join_upload().await {
                Ok(_) => Err(transfer_failed(
                    &self.path,
                    StoreError::Backend("upload ended before the writer was closed".into()),
                )),
                Err(err) => Err(err),
            };
        }
        Ok(())
    }

    async fn upload_failure(&mut self, err: std::io::Error) -> NavError {
        self.pipe = None;
        match self.join_upload().await {
            Err(upload_err) => upload_err,
            Ok(_) => transfer_failed(&self.path, StoreError::Io(err)),
        }
    }

    async fn join_upload(&mut self) -> NavResult<ObjectMetadata> {
        let Some(task) = self.task.take() else {
            return Err(self.closed_error());
        };
        match task.await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(err)) => Err(transfer_failed(&self.path, err)),
            Err(err) => Err(transfer_failed(
                &self.path,
                StoreError::Backend(format!("upload task failed: {err}")),
            )),
        }
    }

    fn closed_error(&self) -> NavError {
        transfer_failed(
            &self.path,
            StoreError::InvalidArgument("writer already finished".into()),
        )
    }
}

impl Drop for ContentWriter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            warn!(path = %self.path, "writer dropped without close; aborting upload");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::io::AsyncReadExt;

    fn setup() -> (Arc<MemoryStore>, ContentStreamBridge) {
        let store = Arc::new(MemoryStore::new());
        store.put_bucket("p", "b");
        let bridge = ContentStreamBridge::new(store.clone());
        (store, bridge)
    }

    #[tokio::test]
    async fn test_should_read_a_few_bytes_at_a_time() {
        let (store, bridge) = setup();
        store.put_object("b", "x.txt", "hello world");
        let mut reader = bridge.open_reader("b", "x.txt").await.unwrap();
        let mut buf = [0u8; 4];
        let mut out = Vec::new();
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_should_adapt_into_async_read() {
        let (store, bridge) = setup();
        store.put_object("b", "x.txt", "hello world");
        let mut reader = bridge.open_reader("b", "x.txt").await.unwrap();
        let mut head = [0u8; 6];
        reader.read(&mut head).await.unwrap();

        let mut rest = String::new();
        reader
            .into_async_read()
            .read_to_string(&mut rest)
            .await
            .unwrap();
        assert_eq!(rest, "world");
    }

    #[tokio::test]
    async fn test_should_report_missing_object_as_not_found() {
        let (_store, bridge) = setup();
        let err = bridge.open_reader("b", "nope").await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_should_commit_on_close() {
        let (store, bridge) = setup();
        let mut writer = bridge.open_writer("b", "out.txt", Some("text/plain".into()));
        writer.write(b"abc").await.unwrap();
        writer.write(b"def").await.unwrap();
        writer.flush().await.unwrap();
        let metadata = writer.close().await.unwrap();
        assert_eq!(metadata.size, 6);
        assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
        assert_eq!(store.object_data("b", "out.txt").unwrap(), Bytes::from("abcdef"));
    }

    #[tokio::test]
    async fn test_should_surface_upload_failure_on_close() {
        let (store, bridge) = setup();
        store.inject_failure("insert_object", "b/out.txt");
        let mut writer = bridge.open_writer("b", "out.txt", None);
        // The upload may already have failed; either way close must report it.
        let _ = writer.write(b"abc").await;
        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, NavError::TransferFailed { .. }));
        assert!(!store.contains_object("b", "out.txt"));
    }

    #[tokio::test]
    async fn test_should_surface_upload_failure_on_write_after_task_stops() {
        let (store, bridge) = setup();
        let mut writer = bridge.open_writer("b-missing", "out.txt", None);
        tokio::task::yield_now().await;
        while !writer.task.as_ref().is_some_and(|t| t.is_finished()) {
            tokio::task::yield_now().await;
        }
        let err = writer.write(b"abc").await.unwrap_err();
        assert!(matches!(err, NavError::TransferFailed { .. }));
        assert_eq!(store.calls("insert_object"), 1);
    }

    #[tokio::test]
    async fn test_should_clear_to_zero_length() {
        let (store, bridge) = setup();
        store.put_object("b", "x.txt", "data");
        let metadata = bridge.clear("b", "x.txt", None).await.unwrap();
        assert_eq!(metadata.size, 0);
        assert!(store.object_data("b", "x.txt").unwrap().is_empty());
    }
}
