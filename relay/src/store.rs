//! Multipart upload of a byte stream with unknown total length.
//!
//! The uploader owns the whole state machine: initiate, fixed-size parts
//! numbered from 1, ordered completion, and abort on any error so that no
//! initiated upload is ever left dangling.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use common::{JobLog, Module, Progress};

use crate::job::OssConfig;

pub const DEFAULT_PART_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to initiate multipart upload: {0}")]
    Init(#[source] anyhow::Error),
    #[error("failed to upload part {number}: {source}")]
    Part {
        number: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to complete multipart upload: {0}")]
    Complete(#[source] anyhow::Error),
    #[error("failed to abort multipart upload: {0}")]
    Abort(#[source] anyhow::Error),
    #[error("failed to read upload source: {0}")]
    Source(#[source] std::io::Error),
}

/// Acknowledgement of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    pub number: usize,
    pub etag: String,
}

/// Seam between the uploader and the concrete object store.
#[async_trait::async_trait]
pub trait MultipartStore: Send + Sync {
    async fn initiate(&self, object: &str) -> Result<String, StoreError>;

    /// Part numbers start at 1 and arrive in strictly increasing order.
    async fn upload_part(
        &self,
        object: &str,
        upload_id: &str,
        number: usize,
        data: Bytes,
    ) -> Result<PartAck, StoreError>;

    /// `parts` is the complete ordered acknowledgement list.
    async fn complete(
        &self,
        object: &str,
        upload_id: &str,
        parts: Vec<PartAck>,
    ) -> Result<(), StoreError>;

    async fn abort(&self, object: &str, upload_id: &str) -> Result<(), StoreError>;
}

/// Upload `source` as `object`, returning the byte count. Every initiated
/// upload ends completed or aborted; the first error is the one returned
/// and abort failures are only logged.
pub async fn upload<R>(
    store: &dyn MultipartStore,
    object: &str,
    part_size: usize,
    source: R,
    progress: Option<&Progress>,
    log: Option<&JobLog>,
) -> Result<u64, StoreError>
where
    R: AsyncRead + Unpin,
{
    let upload_id = store.initiate(object).await?;
    tracing::info!("multipart upload {upload_id} initiated for {object}");
    if let Some(log) = log {
        log.write(
            Module::Oss,
            &format!("multipart upload {upload_id} initiated for {object}"),
        );
    }
    match upload_parts(store, object, &upload_id, part_size, source, progress, log).await {
        Ok(total) => {
            if let Some(log) = log {
                log.write(
                    Module::Oss,
                    &format!("multipart upload {upload_id} completed ({total} bytes)"),
                );
            }
            Ok(total)
        }
        Err(error) => {
            tracing::warn!("aborting multipart upload {upload_id}: {error}");
            if let Err(abort_error) = store.abort(object, &upload_id).await {
                tracing::warn!("abort of upload {upload_id} failed: {abort_error}");
                if let Some(log) = log {
                    log.write(
                        Module::Oss,
                        &format!("abort of upload {upload_id} failed: {abort_error}"),
                    );
                }
            } else if let Some(log) = log {
                log.write(Module::Oss, &format!("multipart upload {upload_id} aborted"));
            }
            Err(error)
        }
    }
}

async fn upload_parts<R>(
    store: &dyn MultipartStore,
    object: &str,
    upload_id: &str,
    part_size: usize,
    mut source: R,
    progress: Option<&Progress>,
    log: Option<&JobLog>,
) -> Result<u64, StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut parts = Vec::new();
    let mut number = 1;
    let mut total = 0u64;
    loop {
        let mut buf = vec![0u8; part_size];
        let mut filled = 0;
        let mut eof = false;
        while filled < part_size {
            let read = source
                .read(&mut buf[filled..])
                .await
                .map_err(StoreError::Source)?;
            if read == 0 {
                eof = true;
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        // an empty stream still produces one (empty) part so completion
        // never submits an empty list
        if filled > 0 || number == 1 {
            let ack = store
                .upload_part(object, upload_id, number, Bytes::from(buf))
                .await?;
            tracing::debug!("part {number} uploaded ({filled} bytes)");
            if let Some(log) = log {
                log.write(Module::Oss, &format!("part {number} uploaded ({filled} bytes)"));
            }
            if let Some(progress) = progress {
                progress.add(filled as u64);
            }
            total += filled as u64;
            parts.push(ack);
            number += 1;
        }
        if eof {
            break;
        }
    }
    store.complete(object, upload_id, parts).await?;
    Ok(total)
}

/// S3-compatible backend against the OSS endpoint. Storage class, object
/// ACL and the optional per-request traffic limit ride on every request as
/// default headers; the remote side is authoritative for object-store
/// throughput, so no local limiter is applied on this path.
pub struct OssStore {
    inner: object_store::aws::AmazonS3,
}

impl OssStore {
    pub fn connect(config: &OssConfig) -> Result<Self, StoreError> {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-oss-storage-class",
            http::HeaderValue::from_static("Standard"),
        );
        headers.insert(
            "x-oss-object-acl",
            http::HeaderValue::from_static("private"),
        );
        if config.rate_limit > 0 {
            let value = http::HeaderValue::from_str(&config.rate_limit.to_string())
                .map_err(|error| StoreError::Init(error.into()))?;
            headers.insert("x-oss-traffic-limit", value);
        }
        let options = object_store::ClientOptions::new()
            .with_default_headers(headers)
            .with_allow_http(true);
        let inner = object_store::aws::AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.access_key_secret)
            .with_virtual_hosted_style_request(true)
            .with_client_options(options)
            .build()
            .map_err(|error| StoreError::Init(error.into()))?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl MultipartStore for OssStore {
    async fn initiate(&self, object: &str) -> Result<String, StoreError> {
        use object_store::multipart::MultipartStore as _;
        let path = object_store::path::Path::from(object);
        self.inner
            .create_multipart(&path)
            .await
            .map_err(|error| StoreError::Init(error.into()))
    }

    async fn upload_part(
        &self,
        object: &str,
        upload_id: &str,
        number: usize,
        data: Bytes,
    ) -> Result<PartAck, StoreError> {
        use object_store::multipart::MultipartStore as _;
        let path = object_store::path::Path::from(object);
        let id = upload_id.to_string();
        // the backend numbers parts from 0
        let part = self
            .inner
            .put_part(&path, &id, number - 1, object_store::PutPayload::from(data))
            .await
            .map_err(|error| StoreError::Part {
                number,
                source: error.into(),
            })?;
        Ok(PartAck {
            number,
            etag: part.content_id,
        })
    }

    async fn complete(
        &self,
        object: &str,
        upload_id: &str,
        parts: Vec<PartAck>,
    ) -> Result<(), StoreError> {
        use object_store::multipart::MultipartStore as _;
        let path = object_store::path::Path::from(object);
        let id = upload_id.to_string();
        let part_ids = parts
            .into_iter()
            .map(|ack| object_store::multipart::PartId {
                content_id: ack.etag,
            })
            .collect();
        self.inner
            .complete_multipart(&path, &id, part_ids)
            .await
            .map_err(|error| StoreError::Complete(error.into()))?;
        Ok(())
    }

    async fn abort(&self, object: &str, upload_id: &str) -> Result<(), StoreError> {
        use object_store::multipart::MultipartStore as _;
        let path = object_store::path::Path::from(object);
        let id = upload_id.to_string();
        self.inner
            .abort_multipart(&path, &id)
            .await
            .map_err(|error| StoreError::Abort(error.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        fail_part: Option<usize>,
        parts: Mutex<Vec<(usize, usize)>>,
        completed: Mutex<Option<Vec<PartAck>>>,
        aborts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MultipartStore for MockStore {
        async fn initiate(&self, _object: &str) -> Result<String, StoreError> {
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _object: &str,
            _upload_id: &str,
            number: usize,
            data: Bytes,
        ) -> Result<PartAck, StoreError> {
            if self.fail_part == Some(number) {
                return Err(StoreError::Part {
                    number,
                    source: anyhow::anyhow!("injected rejection"),
                });
            }
            self.parts.lock().unwrap().push((number, data.len()));
            Ok(PartAck {
                number,
                etag: format!("etag-{number}"),
            })
        }

        async fn complete(
            &self,
            _object: &str,
            _upload_id: &str,
            parts: Vec<PartAck>,
        ) -> Result<(), StoreError> {
            *self.completed.lock().unwrap() = Some(parts);
            Ok(())
        }

        async fn abort(&self, _object: &str, upload_id: &str) -> Result<(), StoreError> {
            self.aborts.lock().unwrap().push(upload_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn eleven_bytes_split_into_two_ordered_parts() {
        let store = MockStore::default();
        let source = std::io::Cursor::new(b"0123456789A".to_vec());
        let total = upload(&store, "obj", 10, source, None, None).await.unwrap();
        assert_eq!(total, 11);
        assert_eq!(*store.parts.lock().unwrap(), vec![(1, 10), (2, 1)]);
        let completed = store.completed.lock().unwrap().clone().unwrap();
        assert_eq!(
            completed.iter().map(|ack| ack.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(store.aborts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_part_aborts_the_upload() {
        let store = MockStore {
            fail_part: Some(2),
            ..MockStore::default()
        };
        let source = std::io::Cursor::new(b"0123456789A".to_vec());
        let error = upload(&store, "obj", 10, source, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Part { number: 2, .. }));
        assert_eq!(*store.aborts.lock().unwrap(), vec!["upload-1".to_string()]);
        assert!(store.completed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_still_completes_with_one_part() {
        let store = MockStore::default();
        let source = std::io::Cursor::new(Vec::new());
        let total = upload(&store, "obj", 10, source, None, None).await.unwrap();
        assert_eq!(total, 0);
        assert_eq!(*store.parts.lock().unwrap(), vec![(1, 0)]);
        assert!(store.completed.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_empty_part() {
        let store = MockStore::default();
        let source = std::io::Cursor::new(vec![7u8; 20]);
        let total = upload(&store, "obj", 10, source, None, None).await.unwrap();
        assert_eq!(total, 20);
        assert_eq!(*store.parts.lock().unwrap(), vec![(1, 10), (2, 10)]);
    }
}
