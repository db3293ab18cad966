use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use log::info;
use s3::config::http::HttpResponse;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, SdkError};
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;

use crate::config::StorageConfig;
use crate::storage::{StorageBackend, StorageError, StoredObject};

/// S3 or any S3-compatible service (MinIO, DigitalOcean Spaces, ...).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
}

/// Connection problems, throttling and 5xx answers are worth another try.
fn classify<E>(operation: &'static str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_)
        | SdkError::DispatchFailure(_)
        | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            status == 429 || status >= 500
        }
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        StorageError::Transient { operation, message }
    } else {
        StorageError::Rejected { operation, message }
    }
}

impl S3Storage {
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let bucket = config
            .bucket
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::NotConfigured("no bucket set".into()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = Credentials::new(key_id, secret, None, None, "Static");
            loader = loader.credentials_provider(credentials);
        }
        let sdk_config = loader.load().await;

        // Custom endpoints rarely support virtual-hosted buckets.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(S3Storage {
            client: s3::Client::from_conf(s3_config),
            bucket,
        })
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify("upload", e))?;

        info!("Uploaded {} to s3://{}/{}", local.display(), self.bucket, key);
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete", e))?;
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify("list", e))?;

            for object in page.contents() {
                objects.push(StoredObject {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(|e| StorageError::Rejected {
                operation: "presign",
                message: e.to_string(),
            })?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify("presign", e))?;
        Ok(request.uri().to_string())
    }

    async fn check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify("head bucket", e))?;
        Ok(())
    }
}
