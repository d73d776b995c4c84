use std::fmt;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {0} does not exist")]
    NotFound(S3Location),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `s3://bucket/key`.
    pub fn parse(uri: &str) -> anyhow::Result<Self> {
        let url = Url::parse(uri).with_context(|| format!("invalid storage location {uri}"))?;
        if url.scheme() != "s3" {
            bail!("expected an s3:// location, got {uri}");
        }
        let bucket = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("storage location {uri} has no bucket"))?;
        Ok(Self::new(bucket, url.path().trim_start_matches('/')))
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// The subset of object storage the tooling relies on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        location: &S3Location,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()>;

    /// Existence check that never downloads the body.
    async fn head_object(&self, location: &S3Location) -> StorageResult<()>;

    async fn get_object(&self, location: &S3Location) -> StorageResult<Bytes>;

    async fn delete_object(&self, location: &S3Location) -> StorageResult<()>;

    /// Uploads a local file, replacing whatever is stored at `location`.
    async fn upload_file(&self, path: &Path, location: &S3Location) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_output_locations() {
        let location =
            S3Location::parse("s3://mahitm-genai/sdxl-output/1b2c3d4e.out").unwrap();
        assert_eq!(location.bucket, "mahitm-genai");
        assert_eq!(location.key, "sdxl-output/1b2c3d4e.out");
        assert_eq!(location.to_string(), "s3://mahitm-genai/sdxl-output/1b2c3d4e.out");
    }

    #[test]
    fn rejects_other_schemes_and_missing_buckets() {
        assert!(S3Location::parse("https://example.com/key").is_err());
        assert!(S3Location::parse("s3:///key").is_err());
        assert!(S3Location::parse("not a url").is_err());
    }
}
