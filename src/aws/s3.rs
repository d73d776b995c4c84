use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::storage::{ObjectStore, S3Location, StorageError, StorageResult};

/// Files above this size are sent as a multipart upload.
const PART_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    async fn upload_parts(
        &self,
        path: &Path,
        location: &S3Location,
        upload_id: &str,
        size: u64,
    ) -> anyhow::Result<()> {
        let mut parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;
        while offset < size {
            let length = PART_SIZE.min(size - offset);
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .with_context(|| format!("failed to read part {part_number} of {}", path.display()))?;
            let part = self
                .client
                .upload_part()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| anyhow!("part {part_number}: {}", DisplayErrorContext(e)))?;
            let e_tag: Option<&str> = part.e_tag().into();
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(e_tag.map(String::from))
                    .part_number(part_number)
                    .build(),
            );
            debug!(part_number, length, "uploaded part");
            offset += length;
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }
}

fn other<E>(location: &S3Location, action: &str, error: E) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Other(anyhow!("failed to {action} {location}: {}", DisplayErrorContext(error)))
}

fn is_missing<E: ProvideErrorMetadata>(error: &E) -> bool {
    matches!(error.code(), Some("NoSuchKey" | "NotFound"))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_object(
        &self,
        location: &S3Location,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| other(location, "upload", e))?;
        Ok(())
    }

    async fn head_object(&self, location: &S3Location) -> StorageResult<()> {
        match self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error().is_some_and(HeadObjectError::is_not_found)
                    || is_missing(&e) =>
            {
                Err(StorageError::NotFound(location.clone()))
            }
            Err(e) => Err(other(location, "check", e)),
        }
    }

    async fn get_object(&self, location: &S3Location) -> StorageResult<Bytes> {
        let output = match self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e)
                if e.as_service_error().is_some_and(GetObjectError::is_no_such_key)
                    || is_missing(&e) =>
            {
                return Err(StorageError::NotFound(location.clone()))
            }
            Err(e) => return Err(other(location, "download", e)),
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| other(location, "read", e))?;
        Ok(body.into_bytes())
    }

    async fn delete_object(&self, location: &S3Location) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| other(location, "delete", e))?;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, location: &S3Location) -> StorageResult<()> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        if size <= PART_SIZE {
            let body = ByteStream::from_path(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            self.client
                .put_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .body(body)
                .send()
                .await
                .map_err(|e| other(location, "upload to", e))?;
            return Ok(());
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| other(location, "start upload to", e))?;
        let upload_id: Option<&str> = created.upload_id().into();
        let upload_id = upload_id
            .with_context(|| format!("no upload id returned for {location}"))?
            .to_string();
        info!(size, "Uploading {} to {location} in parts", path.display());

        if let Err(e) = self.upload_parts(path, location, &upload_id, size).await {
            if let Err(abort) = self
                .client
                .abort_multipart_upload()
                .bucket(&location.bucket)
                .key(&location.key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!("Error aborting upload {upload_id}: {}", DisplayErrorContext(abort));
            }
            return Err(e.context(format!("failed to upload {} to {location}", path.display())).into());
        }
        Ok(())
    }
}
