//! Native AWS S3 SDK integration
//!
//! Inspects sources with `HeadObject` and exports ranges with a multipart
//! upload whose parts are filled by `UploadPartCopy`, so S3 copies the
//! bytes server-side. Supports S3-compatible endpoints (MinIO, Wasabi,
//! etc.) and retries individual part copies with exponential backoff.
//!
//! `exists` and `size` share one `HeadObject`: the length seen by `exists`
//! is kept until the following `size` call for the same object takes it.

use super::{BlobStore, ObjectUri, RangeExporter, SourceInspector};
use crate::error::{DeltaCopyError, Result};
use async_trait::async_trait;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// URI scheme served by [`S3BlobStore`]
pub const S3_SCHEME: &str = "s3";

/// Largest range a single `UploadPartCopy` may copy: 5 GiB.
pub const MAX_PART_COPY_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum retry delay cap in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 64;

/// Configuration for the S3 store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Wasabi)
    pub endpoint_url: Option<String>,
    /// Maximum number of retries per part copy
    pub max_retries: u32,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
    /// Access key ID (optional, falls back to AWS credential chain)
    pub access_key_id: Option<String>,
    /// Secret access key (optional, falls back to AWS credential chain)
    pub secret_access_key: Option<String>,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            max_retries: 5,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Lengths observed by `exists`, each handed out once to `size`
#[derive(Default)]
struct HeadCache {
    lengths: Mutex<HashMap<String, u64>>,
}

impl HeadCache {
    fn remember(&self, source: &ObjectUri, length: u64) {
        self.lock().insert(source.to_string(), length);
    }

    fn take(&self, source: &ObjectUri) -> Option<u64> {
        self.lock().remove(&source.to_string())
    }

    fn forget(&self, source: &ObjectUri) {
        self.lock().remove(&source.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.lengths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    config: S3StoreConfig,
    heads: HeadCache,
}

impl S3BlobStore {
    /// Create a new store from configuration.
    pub async fn new(config: S3StoreConfig) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        // Explicit credentials win over the default provider chain
        if let (Some(ref key_id), Some(ref secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiry
                "deltacopy-static",
            );
            aws_config_builder = aws_config_builder.credentials_provider(creds);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        let client = aws_sdk_s3::Client::from_conf(s3_config.build());

        Ok(Self {
            client,
            config,
            heads: HeadCache::default(),
        })
    }

    fn check_scheme(uri: &ObjectUri) -> Result<()> {
        if uri.scheme() != S3_SCHEME {
            return Err(DeltaCopyError::InvalidUri(format!(
                "{}: S3 store only serves {}://",
                uri, S3_SCHEME
            )));
        }
        Ok(())
    }

    /// Best-effort cleanup of an unfinished multipart upload
    async fn abort_upload(&self, target: &ObjectUri, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(target.container())
            .key(target.key())
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(target_id = %target, "S3 abort_multipart_upload failed: {}", e);
        }
    }

    /// Copy every part of the range into the open multipart upload.
    async fn copy_parts(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        upload_id: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<CompletedPart>> {
        let copy_source = format!(
            "{}/{}",
            source.container(),
            urlencoding::encode(source.key())
        );

        let mut parts = Vec::new();
        for (index, (first, last)) in part_ranges(start, length).into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let range = format!("bytes={}-{}", first, last);

            let mut retries = 0;
            let etag = loop {
                let attempt = self
                    .client
                    .upload_part_copy()
                    .bucket(target.container())
                    .key(target.key())
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .copy_source(&copy_source)
                    .copy_source_range(&range)
                    .send()
                    .await;

                match attempt {
                    Ok(output) => {
                        break output
                            .copy_part_result()
                            .and_then(|r| r.e_tag())
                            .unwrap_or_default()
                            .to_string();
                    }
                    Err(e) if retries < self.config.max_retries => {
                        retries += 1;
                        let delay = exponential_backoff_delay(retries);
                        tracing::warn!(
                            target_id = %target,
                            part = part_number,
                            "S3 upload_part_copy failed (attempt {}/{}): {}. Retrying in {:?}",
                            retries,
                            self.config.max_retries,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return Err(DeltaCopyError::export(
                            source.to_string(),
                            target.to_string(),
                            format!("upload_part_copy {} failed: {}", range, e),
                        ));
                    }
                }
            };

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
        }

        Ok(parts)
    }
}

#[async_trait]
impl SourceInspector for S3BlobStore {
    async fn exists(&self, source: &ObjectUri) -> Result<bool> {
        Self::check_scheme(source)?;

        match self
            .client
            .head_object()
            .bucket(source.container())
            .key(source.key())
            .send()
            .await
        {
            Ok(head) => {
                match head.content_length().and_then(|len| u64::try_from(len).ok()) {
                    Some(length) => self.heads.remember(source, length),
                    None => self.heads.forget(source),
                }
                Ok(true)
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    self.heads.forget(source);
                    Ok(false)
                } else {
                    Err(DeltaCopyError::source_unavailable(
                        source.to_string(),
                        format!("S3 head_object failed: {}", service_err),
                    ))
                }
            }
        }
    }

    async fn size(&self, source: &ObjectUri) -> Result<u64> {
        Self::check_scheme(source)?;
        if let Some(length) = self.heads.take(source) {
            return Ok(length);
        }

        let head = self
            .client
            .head_object()
            .bucket(source.container())
            .key(source.key())
            .send()
            .await
            .map_err(|e| {
                DeltaCopyError::source_unavailable(
                    source.to_string(),
                    format!("S3 head_object failed: {}", e),
                )
            })?;

        let length = head.content_length().ok_or_else(|| {
            DeltaCopyError::source_unavailable(source.to_string(), "missing Content-Length")
        })?;
        u64::try_from(length).map_err(|_| {
            DeltaCopyError::source_unavailable(source.to_string(), "negative Content-Length")
        })
    }
}

#[async_trait]
impl RangeExporter for S3BlobStore {
    async fn export_range(
        &self,
        source: &ObjectUri,
        target: &ObjectUri,
        start: u64,
        length: u64,
    ) -> Result<()> {
        Self::check_scheme(source)?;
        Self::check_scheme(target)?;
        if length == 0 {
            return Err(DeltaCopyError::export(source.to_string(), target.to_string(), "empty range"));
        }

        let create = self
            .client
            .create_multipart_upload()
            .bucket(target.container())
            .key(target.key())
            .send()
            .await
            .map_err(|e| {
                DeltaCopyError::export(
                    source.to_string(),
                    target.to_string(),
                    format!("S3 create_multipart_upload failed: {}", e),
                )
            })?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| {
                DeltaCopyError::export(source.to_string(), target.to_string(), "missing upload_id")
            })?
            .to_string();

        let completed = match self.copy_parts(source, target, &upload_id, start, length).await {
            Ok(parts) => CompletedMultipartUpload::builder().set_parts(Some(parts)).build(),
            Err(e) => {
                self.abort_upload(target, &upload_id).await;
                return Err(e);
            }
        };

        let completion = self
            .client
            .complete_multipart_upload()
            .bucket(target.container())
            .key(target.key())
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .if_none_match("*")
            .send()
            .await
            .map_err(|e| {
                DeltaCopyError::export(
                    source.to_string(),
                    target.to_string(),
                    format!("S3 complete_multipart_upload failed: {}", e),
                )
            });

        if completion.is_err() {
            self.abort_upload(target, &upload_id).await;
        }
        completion.map(|_| ())
    }
}

impl BlobStore for S3BlobStore {
    fn scheme(&self) -> &str {
        S3_SCHEME
    }
}

/// Split `[start, start+length)` into inclusive byte ranges of at most
/// [`MAX_PART_COPY_SIZE`] bytes, as used by `x-amz-copy-source-range`.
fn part_ranges(start: u64, length: u64) -> Vec<(u64, u64)> {
    let end = start + length;
    let mut ranges = Vec::new();
    let mut first = start;
    while first < end {
        let next = (first + MAX_PART_COPY_SIZE).min(end);
        ranges.push((first, next - 1));
        first = next;
    }
    ranges
}

/// Calculate exponential backoff delay: 2^retries seconds, capped at MAX_RETRY_DELAY_SECS.
fn exponential_backoff_delay(retries: u32) -> Duration {
    let secs = (1u64 << retries.min(63)).min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_cache_hands_out_length_once() {
        let cache = HeadCache::default();
        let a = ObjectUri::parse("s3://bucket/logs/a.log").unwrap();
        let b = ObjectUri::parse("s3://bucket/logs/b.log").unwrap();

        cache.remember(&a, 42);
        assert_eq!(cache.take(&b), None);
        assert_eq!(cache.take(&a), Some(42));
        assert_eq!(cache.take(&a), None);

        cache.remember(&b, 7);
        cache.remember(&b, 9);
        assert_eq!(cache.take(&b), Some(9));

        cache.remember(&a, 1);
        cache.forget(&a);
        assert_eq!(cache.take(&a), None);
    }

    #[test]
    fn test_default_config() {
        let config = S3StoreConfig::default();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.max_retries, 5);
        assert!(!config.force_path_style);
    }

    #[test]
    fn test_exponential_backoff() {
        assert_eq!(exponential_backoff_delay(1), Duration::from_secs(2));
        assert_eq!(exponential_backoff_delay(3), Duration::from_secs(8));
        assert_eq!(exponential_backoff_delay(6), Duration::from_secs(64));
        assert_eq!(exponential_backoff_delay(10), Duration::from_secs(64));
    }

    #[test]
    fn test_part_ranges() {
        assert_eq!(part_ranges(100, 50), vec![(100, 149)]);

        let ranges = part_ranges(0, MAX_PART_COPY_SIZE * 2 + 1);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (0, MAX_PART_COPY_SIZE - 1));
        assert_eq!(ranges[2], (MAX_PART_COPY_SIZE * 2, MAX_PART_COPY_SIZE * 2));
    }
}
