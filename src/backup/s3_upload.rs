// backman/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use secrecy::ExposeSecret;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::compress::UploadBody;
use crate::config::SpacesConfig;
use crate::errors::UploadError;

/// First multipart part size. S3 requires at least 5 MiB for every part but the last.
const PART_SIZE: usize = 8 * 1024 * 1024;
/// Parts uploaded before the part size doubles.
const PARTS_PER_STEP: i32 = 2_000;
/// S3 caps a multipart upload at this many parts.
const MAX_PARTS: i32 = 10_000;

/// Size of part `part_number` (1-based). Grows with the part count so a dump
/// of unknown length fits in `MAX_PARTS`: 8 MiB for the first 2000 parts, then
/// doubling every 2000 parts up to 128 MiB, roughly 484 GiB in total.
fn part_size(part_number: i32) -> usize {
    let step = (part_number.max(1) - 1) / PARTS_PER_STEP;
    PART_SIZE << step.min(4)
}

fn check_part_limit(part_number: i32) -> Result<(), UploadError> {
    if part_number > MAX_PARTS {
        return Err(UploadError::Store(format!(
            "dump is larger than a {}-part multipart upload can hold",
            MAX_PARTS
        )));
    }
    Ok(())
}

/// Streams a body of possibly unknown length to object storage.
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Reads `body` (of unknown length) to end-of-stream and stores it at
    /// `path`. Must return promptly with [`UploadError::Cancelled`] once
    /// `cancel` fires.
    async fn upload(&self, cancel: CancellationToken, path: &str, body: UploadBody) -> Result<(), UploadError>;
}

/// Uploader for an S3-compatible object storage service (like DigitalOcean Spaces).
#[derive(Debug, Clone)]
pub struct S3Uploader {
    client: s3::Client,
    bucket: String,
}

fn store_err<E: std::fmt::Display>(e: E) -> UploadError {
    UploadError::Store(e.to_string())
}

impl S3Uploader {
    pub fn new(client: s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                spaces_config.secret_access_key.expose_secret(),
                None,
                None,
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();
        Self::new(s3::Client::from_conf(s3_config), &spaces_config.bucket_name)
    }

    async fn put_multipart(&self, key: &str, mut body: UploadBody, upload_id: &str) -> Result<u64, UploadError> {
        let mut parts = Vec::new();
        let mut total = 0u64;

        loop {
            let part_number = parts.len() as i32 + 1;
            let size = part_size(part_number);
            let mut buf = Vec::with_capacity(size);
            (&mut body).take(size as u64).read_to_end(&mut buf).await?;
            // Always send at least one part; S3 rejects an empty part list.
            if buf.is_empty() && !parts.is_empty() {
                break;
            }
            check_part_limit(part_number)?;
            let last = buf.len() < size;
            total += buf.len() as u64;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(store_err)?;
            debug!(key, part_number, "uploaded part");

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            if last {
                break;
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(store_err)?;
        Ok(total)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key, "could not abort multipart upload {}: {}", upload_id, e);
        }
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: UploadBody,
    ) -> Result<u64, UploadError> {
        let create = self.client.create_multipart_upload().bucket(&self.bucket).key(key).send();
        let created = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            created = create => created.map_err(store_err)?,
        };
        let upload_id = created
            .upload_id()
            .ok_or_else(|| UploadError::Store("create multipart upload returned no upload id".to_string()))?
            .to_string();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            res = self.put_multipart(key, body, &upload_id) => res,
        };
        if result.is_err() {
            self.abort_multipart(key, &upload_id).await;
        }
        result
    }
}

#[async_trait]
impl ObjectUploader for S3Uploader {
    async fn upload(&self, cancel: CancellationToken, path: &str, body: UploadBody) -> Result<(), UploadError> {
        info!("uploading s3://{}/{}", self.bucket, path);
        let uploaded = self.stream(&cancel, path, body).await?;
        info!("uploaded {} bytes to s3://{}/{}", uploaded, self.bucket, path);
        Ok(())
    }
}
