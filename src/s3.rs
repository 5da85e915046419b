//! S3 plumbing for the bulk pipeline: byte-range reads and the
//! multipart-upload shard writer.

use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Minimum part byte size for multipart uploads; S3 rejects smaller parts
/// except the final one.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not an S3 URI: {0}")]
    NotS3(String),
    #[error("malformed S3 URI: {0}")]
    MalformedUri(String),
    #[error("s3 {op} failed: {message}")]
    Operation { op: String, message: String },
    #[error("multipart upload for {0} was never started")]
    NotStarted(String),
}

pub fn is_s3_url(url: &str) -> bool {
    url.starts_with("s3:/")
}

/// Parse an S3 URI and return bucket and key.
pub fn parse_s3_uri(uri: &str) -> Result<(String, String), Error> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| Error::NotS3(uri.to_string()))?;
    match rest.find('/') {
        Some(i) if i > 0 && i < rest.len() - 1 => {
            Ok((rest[..i].to_string(), rest[i + 1..].to_string()))
        }
        _ => Err(Error::MalformedUri(uri.to_string())),
    }
}

fn backoff(attempt: u32, base_backoff_seconds: f64) -> Duration {
    let base = base_backoff_seconds * f64::powi(2.0, attempt as i32 - 1);
    // jitter between 80% and 120% of the base delay
    let jittered = base * rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(jittered.max(0.05))
}

/// Run an S3 operation with bounded retries and jittered exponential
/// backoff. The operation is rebuilt from scratch each attempt.
pub async fn with_retries<T, F, Fut>(
    mut f: F,
    op_name: &str,
    max_attempts: u32,
    base_backoff_seconds: f64,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last = String::new();
    for attempt in 1..=max_attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(message) => {
                last = message;
                if attempt >= max_attempts {
                    log::error!("{} failed after {} attempts: {}", op_name, attempt, last);
                    break;
                }
                let sleep = backoff(attempt, base_backoff_seconds);
                log::warn!(
                    "{} failed (attempt {}/{}) - retrying in {:.2}s",
                    op_name,
                    attempt,
                    max_attempts,
                    sleep.as_secs_f64()
                );
                tokio::time::sleep(sleep).await;
            }
        }
    }
    Err(Error::Operation {
        op: op_name.to_string(),
        message: last,
    })
}

/// Ranged GET of `[offset, offset+length)` from an S3 object.
pub async fn ranged_get(
    client: &Client,
    bucket: &str,
    key: &str,
    offset: u64,
    length: u64,
    max_attempts: u32,
    base_backoff_seconds: f64,
) -> Result<Bytes, Error> {
    let end = offset + length - 1; // inclusive
    let range = format!("bytes={}-{}", offset, end);
    let op_name = format!("ranged_get {}/{}[{}:{}]", bucket, key, offset, end);

    let range = &range;
    with_retries(
        move || async move {
            let resp = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .range(range)
                .send()
                .await
                .map_err(|e| format!("{:?}", e))?;
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| format!("{:?}", e))?;
            Ok(data.into_bytes())
        },
        &op_name,
        max_attempts,
        base_backoff_seconds,
    )
    .await
}

/// Manages one multipart upload: buffers bytes, flushes full-size parts,
/// completes (or aborts) on close.
pub struct S3ShardWriter {
    client: Client,
    dest_bucket: String,
    shard_key: String,
    content_type: Option<String>,
    min_part_size: usize,
    max_attempts: u32,
    base_backoff_seconds: f64,
    upload_id: Option<String>,
    part_number: i32,
    parts: Vec<CompletedPart>,
    buffer: Vec<u8>,
}

impl S3ShardWriter {
    pub fn new(
        client: Client,
        dest_bucket: &str,
        shard_key: &str,
        content_type: Option<&str>,
        min_part_size: usize,
        max_attempts: u32,
        base_backoff_seconds: f64,
    ) -> Self {
        Self {
            client,
            dest_bucket: dest_bucket.to_string(),
            shard_key: shard_key.to_string(),
            content_type: content_type.map(str::to_string),
            min_part_size,
            max_attempts,
            base_backoff_seconds,
            upload_id: None,
            part_number: 1,
            parts: Vec::new(),
            buffer: Vec::new(),
        }
    }

    pub async fn start(&mut self) -> Result<(), Error> {
        let op_name = format!(
            "create_multipart_upload {}/{}",
            self.dest_bucket, self.shard_key
        );
        let client = &self.client;
        let bucket = &self.dest_bucket;
        let key = &self.shard_key;
        let content_type = self.content_type.as_deref();
        let upload_id = with_retries(
            move || async move {
                let mut req = client.create_multipart_upload().bucket(bucket).key(key);
                if let Some(ct) = content_type {
                    req = req.content_type(ct);
                }
                let resp = req.send().await.map_err(|e| format!("{:?}", e))?;
                resp.upload_id()
                    .map(str::to_string)
                    .ok_or_else(|| "no UploadId in response".to_string())
            },
            &op_name,
            self.max_attempts,
            self.base_backoff_seconds,
        )
        .await?;

        log::info!(
            "Started MPU for {} (UploadId={})",
            self.shard_key,
            upload_id
        );
        self.upload_id = Some(upload_id);
        Ok(())
    }

    fn upload_id(&self) -> Result<&str, Error> {
        self.upload_id
            .as_deref()
            .ok_or_else(|| Error::NotStarted(self.shard_key.clone()))
    }

    async fn upload_part(&mut self, body: Vec<u8>) -> Result<(), Error> {
        let upload_id = self.upload_id()?.to_string();
        let part_number = self.part_number;
        let op_name = format!(
            "upload_part {}/{}#{}",
            self.dest_bucket, self.shard_key, part_number
        );

        let body = Bytes::from(body);
        let client = &self.client;
        let bucket = &self.dest_bucket;
        let key = &self.shard_key;
        let upload_id = &upload_id;
        let body = &body;
        let etag = with_retries(
            move || async move {
                let resp = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body.clone().into())
                    .send()
                    .await
                    .map_err(|e| format!("{:?}", e))?;
                resp.e_tag()
                    .map(str::to_string)
                    .ok_or_else(|| "no ETag in response".to_string())
            },
            &op_name,
            self.max_attempts,
            self.base_backoff_seconds,
        )
        .await?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(etag)
                .build(),
        );
        self.part_number += 1;
        Ok(())
    }

    async fn flush_full_parts(&mut self) -> Result<(), Error> {
        while self.buffer.len() >= self.min_part_size {
            let rest = self.buffer.split_off(self.min_part_size);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            self.upload_part(chunk).await?;
        }
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(data);
        self.flush_full_parts().await
    }

    /// Flush the tail part and complete the upload; on any failure, make a
    /// best-effort abort so no incomplete upload is leaked.
    pub async fn close(mut self) -> Result<(), Error> {
        let result = self.complete().await;
        if let Err(e) = &result {
            log::error!(
                "Completing MPU failed for {}; attempting abort: {}",
                self.shard_key,
                e
            );
            self.abort().await;
        }
        result
    }

    async fn complete(&mut self) -> Result<(), Error> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.upload_part(tail).await?;
        }

        if !self.parts.is_empty() {
            let upload_id = self.upload_id()?.to_string();
            let op_name = format!(
                "complete_multipart_upload {}/{}",
                self.dest_bucket, self.shard_key
            );
            let client = &self.client;
            let bucket = &self.dest_bucket;
            let key = &self.shard_key;
            let upload_id = &upload_id;
            let parts = &self.parts;
            with_retries(
                move || async move {
                    client
                        .complete_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .multipart_upload(
                            CompletedMultipartUpload::builder()
                                .set_parts(Some(parts.clone()))
                                .build(),
                        )
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| format!("{:?}", e))
                },
                &op_name,
                self.max_attempts,
                self.base_backoff_seconds,
            )
            .await?;
        }
        log::info!(
            "Completed MPU for {} with {} parts.",
            self.shard_key,
            self.parts.len()
        );
        Ok(())
    }

    /// Repeated aborts on the same UploadId are tolerated by S3.
    async fn abort(&self) {
        let Some(upload_id) = self.upload_id.as_deref() else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.dest_bucket)
            .key(&self.shard_key)
            .upload_id(upload_id)
            .send()
            .await
        {
            log::error!(
                "Failed to abort MPU {} on {}/{}: {:?}",
                upload_id,
                self.dest_bucket,
                self.shard_key,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parsing() {
        assert_eq!(
            parse_s3_uri("s3://commoncrawl/crawl-data/file.warc.gz").unwrap(),
            (
                "commoncrawl".to_string(),
                "crawl-data/file.warc.gz".to_string()
            )
        );
        assert!(parse_s3_uri("https://example.com/x").is_err());
        assert!(parse_s3_uri("s3://bucket-only").is_err());
        assert!(parse_s3_uri("s3://bucket/").is_err());
        assert!(parse_s3_uri("s3:///key").is_err());
    }

    #[test]
    fn s3_detection() {
        assert!(is_s3_url("s3://bucket/key"));
        assert!(!is_s3_url("https://bucket/key"));
    }

    #[test]
    fn backoff_growth_and_jitter() {
        for attempt in 1..6 {
            let d = backoff(attempt, 0.5);
            let base = 0.5 * f64::powi(2.0, attempt as i32 - 1);
            assert!(d.as_secs_f64() >= (base * 0.8).max(0.05) - 1e-9);
            assert!(d.as_secs_f64() <= base * 1.2 + 1e-9);
        }
    }

    #[tokio::test]
    async fn retries_eventually_fail() {
        let mut calls = 0;
        let result: Result<(), Error> = with_retries(
            || {
                calls += 1;
                async { Err::<(), String>("nope".to_string()) }
            },
            "test_op",
            3,
            0.001,
        )
        .await;
        assert!(matches!(result, Err(Error::Operation { .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retries_pass_through_success() {
        let mut calls = 0;
        let result = with_retries(
            || {
                calls += 1;
                let ok = calls >= 2;
                async move {
                    if ok {
                        Ok(42)
                    } else {
                        Err("flaky".to_string())
                    }
                }
            },
            "test_op",
            5,
            0.001,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
