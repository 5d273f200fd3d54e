use keygate::storage::{DELIMITER, ListOutput, ObjectEntry, Storage, StorageError};

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

/// [`Storage`] over an S3-compatible bucket (AWS S3, Cloudflare R2, MinIO).
pub struct S3Storage {
    client: Client,
    bucket: String,
}

fn backend<E>(err: E) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Backend(Box::new(err))
}

impl S3Storage {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the standard AWS environment.
    ///
    /// R2 needs `endpoint_url` set to `https://<account>.r2.cloudflarestorage.com` and
    /// `AWS_REGION=auto`.
    pub async fn from_env(bucket: impl Into<String>, endpoint_url: Option<&str>, force_path_style: bool) -> Self {
        let sdk_conf = aws_config::from_env().load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_conf).force_path_style(force_path_style);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url);
        }
        Self::new(Client::from_conf(builder.build()), bucket)
    }
}

#[async_trait::async_trait]
impl Storage for S3Storage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;
        let output = match result {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                debug!(bucket = %self.bucket, key, "no such key");
                return Ok(None);
            }
            Err(err) => return Err(backend(err)),
        };
        let data = output.body.collect().await.map_err(backend)?;
        Ok(Some(data.into_bytes()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<ListOutput, StorageError> {
        let mut out = ListOutput::default();
        let mut continuation = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter(DELIMITER)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(backend)?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0);
                    out.objects.push(ObjectEntry {
                        key: key.to_owned(),
                        size,
                    });
                }
            }
            out.prefixes
                .extend(page.common_prefixes().iter().filter_map(|p| p.prefix()).map(str::to_owned));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated() == Some(true) => continuation = Some(token.to_owned()),
                _ => break,
            }
        }
        Ok(out)
    }
}
