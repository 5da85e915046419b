//! Bulk WARC extraction driven by CDX input: a three-stage cooperative
//! pipeline.
//!
//! ```text
//! [job generator] -> jobs queue -> [readers xR] -> records queue -> [writers xW]
//! ```
//!
//! Both queues are bounded; the bound is the backpressure mechanism. The
//! generator posts R STOP sentinels when its input is exhausted; a
//! coordinator posts W STOP sentinels once the last reader returns. Each
//! writer owns exactly one rotating output shard. Record order between
//! input and output is not preserved; within one shard, records appear in
//! the order the writer received them.

use crate::myrequests::{self, GetOpts};
use crate::s3::{self, is_s3_url, parse_s3_uri, ranged_get, S3ShardWriter, MIN_PART_SIZE};
use crate::settings;
use crate::warc::record::WarcRecord;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_JOBS_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_RECORDS_QUEUE_SIZE: usize = 200;
pub const DEFAULT_FETCHER_TO_CONSUMER_RATIO: usize = 6;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot parse cdx line: {0}")]
    BadCdxLine(String),
    #[error("bad glob pattern: {0}")]
    BadGlob(#[from] glob::PatternError),
    #[error(transparent)]
    S3(#[from] s3::Error),
    #[error(transparent)]
    Http(#[from] myrequests::Error),
    #[error(transparent)]
    Record(#[from] crate::warc::record::Error),
    #[error("metadata must be JSON (file path ends with *.json): {0}")]
    BadMetadataPath(String),
    #[error("bad resource record metadata: {0}")]
    BadMetadata(#[from] serde_json::Error),
    #[error("resource record paths and metadata paths must pair up")]
    MismatchedResourcePaths,
    #[error("pipeline queue closed unexpectedly")]
    QueueClosed,
    #[error("pipeline task panicked: {0}")]
    TaskFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Error::QueueClosed
    }
}

/// An addressed byte range of a WARC file. `records_count` is >= 1 so
/// grouped ranges can be introduced without a schema change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeJob {
    pub url: String,
    pub offset: u64,
    pub length: u64,
    pub records_count: u64,
}

impl RangeJob {
    pub fn is_s3(&self) -> bool {
        is_s3_url(&self.url)
    }

    /// Ranged read via S3 or HTTP, depending on the job's URL scheme.
    pub async fn ranged_get_bytes(
        &self,
        max_attempts: u32,
        base_backoff_seconds: f64,
        s3_client: Option<&aws_sdk_s3::Client>,
    ) -> Result<Bytes, Error> {
        if self.is_s3() {
            let (bucket, key) = parse_s3_uri(&self.url)?;
            let client = s3_client.ok_or(Error::S3(s3::Error::NotS3(
                "no S3 client for an s3:// job".to_string(),
            )))?;
            Ok(ranged_get(
                client,
                &bucket,
                &key,
                self.offset,
                self.length,
                max_attempts,
                base_backoff_seconds,
            )
            .await?)
        } else {
            let end = self.offset + self.length - 1; // inclusive
            let mut headers = HeaderMap::new();
            headers.insert(
                RANGE,
                HeaderValue::from_str(&format!("bytes={}-{}", self.offset, end))
                    .map_err(|_| Error::BadCdxLine(self.url.clone()))?,
            );
            let resp = myrequests::get(&self.url, &[], Some(headers), GetOpts::default()).await?;
            Ok(resp.body)
        }
    }
}

/// A fetched range.
#[derive(Clone, Debug)]
pub struct RangePayload {
    pub job: RangeJob,
    pub data: Bytes,
}

enum JobMsg {
    Job(RangeJob),
    Stop,
}

enum RecordMsg {
    Payload(RangePayload),
    Stop,
}

/// Throughput accounting for readers and writers.
#[derive(Clone, Debug)]
pub struct ThroughputTracker {
    start: Instant,
    pub total_bytes: u64,
    pub total_requests: u64,
    pub total_records: u64,
}

impl ThroughputTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            total_bytes: 0,
            total_requests: 0,
            total_records: 0,
        }
    }

    pub fn add(&mut self, bytes_count: u64, records_count: u64) {
        self.total_bytes += bytes_count;
        self.total_requests += 1;
        self.total_records += records_count;
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn mb_per_sec(&self) -> f64 {
        let elapsed = self.elapsed();
        if elapsed > 0.0 {
            (self.total_bytes as f64 / elapsed) / (1024.0 * 1024.0)
        } else {
            0.0
        }
    }

    pub fn requests_per_sec(&self) -> f64 {
        let elapsed = self.elapsed();
        if elapsed > 0.0 {
            self.total_requests as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Parse one CC-style CDX line: `<surt> <timestamp> <json>`, where the
/// JSON carries `filename`, `offset`, and `length`.
pub fn read_cdx_line(line: &str, warc_download_prefix: &str) -> Result<RangeJob, Error> {
    let mut cols = line.trim_end().splitn(3, ' ');
    let (_surt, _timestamp, json) = match (cols.next(), cols.next(), cols.next()) {
        (Some(s), Some(t), Some(j)) => (s, t, j),
        _ => return Err(Error::BadCdxLine(line.to_string())),
    };

    let data: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(json).map_err(|_| Error::BadCdxLine(line.to_string()))?;

    let field = |name: &str| -> Result<String, Error> {
        match data.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::BadCdxLine(line.to_string())),
        }
    };

    let filename = field("filename")?;
    let offset: u64 = field("offset")?
        .parse()
        .map_err(|_| Error::BadCdxLine(line.to_string()))?;
    let length: u64 = field("length")?
        .parse()
        .map_err(|_| Error::BadCdxLine(line.to_string()))?;

    Ok(RangeJob {
        url: format!("{}/{}", warc_download_prefix, filename),
        offset,
        length,
        records_count: 1,
    })
}

/// Open a CDX index (local path, `s3://`, or `http(s)://`; gzipped or
/// plain) as a line iterator. Local files are streamed; remote indexes
/// are fetched into memory first.
async fn open_cdx_lines(
    index_path: &str,
    s3_client: Option<&aws_sdk_s3::Client>,
    max_attempts: u32,
    base_backoff_seconds: f64,
) -> Result<Box<dyn Iterator<Item = std::io::Result<String>> + Send>, Error> {
    log::info!("Reading CDX from {}", index_path);

    let gz = index_path.ends_with(".gz");
    if is_s3_url(index_path) || index_path.starts_with("https://") || index_path.starts_with("http://")
    {
        let raw: Vec<u8> = if is_s3_url(index_path) {
            let (bucket, key) = parse_s3_uri(index_path)?;
            let client = s3_client.ok_or(Error::S3(s3::Error::NotS3(
                "no S3 client for an s3:// index".to_string(),
            )))?;
            let op_name = format!("get_object {}/{}", bucket, key);
            let bucket = &bucket;
            let key = &key;
            s3::with_retries(
                move || async move {
                    let resp = client
                        .get_object()
                        .bucket(bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| format!("{:?}", e))?;
                    let data = resp.body.collect().await.map_err(|e| format!("{:?}", e))?;
                    Ok(data.into_bytes().to_vec())
                },
                &op_name,
                max_attempts,
                base_backoff_seconds,
            )
            .await?
        } else {
            myrequests::get(index_path, &[], None, GetOpts::default())
                .await?
                .body
                .to_vec()
        };

        let text = if gz || raw.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = MultiGzDecoder::new(raw.as_slice());
            let mut out = String::new();
            decoder.read_to_string(&mut out)?;
            out
        } else {
            String::from_utf8_lossy(&raw).into_owned()
        };
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        Ok(Box::new(lines.into_iter().map(Ok)))
    } else {
        let file = std::fs::File::open(index_path)?;
        if gz {
            Ok(Box::new(
                BufReader::new(MultiGzDecoder::new(file)).lines(),
            ))
        } else {
            Ok(Box::new(BufReader::new(file).lines()))
        }
    }
}

/// Find CDX index paths, optionally via a glob pattern appended to the
/// base path.
pub fn get_cdx_paths(cdx_path: &str, cdx_glob: Option<&str>) -> Result<Vec<String>, Error> {
    match cdx_glob {
        None => Ok(vec![cdx_path.to_string()]),
        Some(pattern) => {
            let full_glob = format!("{}{}", cdx_path, pattern);
            log::info!("glob pattern from {}", full_glob);
            let mut paths: Vec<String> = glob::glob(&full_glob)?
                .filter_map(|entry| entry.ok())
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            paths.sort();
            log::info!("glob pattern found {} index files", paths.len());
            Ok(paths)
        }
    }
}

/// One output shard, local or S3. Rotation happens above this layer.
enum ShardWriter {
    Local(tokio::io::BufWriter<tokio::fs::File>),
    S3(S3ShardWriter),
}

impl ShardWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            ShardWriter::Local(file) => Ok(file.write_all(data).await?),
            ShardWriter::S3(shard) => Ok(shard.write(data).await?),
        }
    }

    async fn close(self) -> Result<(), Error> {
        match self {
            ShardWriter::Local(mut file) => {
                file.flush().await?;
                file.shutdown().await?;
                Ok(())
            }
            ShardWriter::S3(shard) => Ok(shard.close().await?),
        }
    }
}

fn generate_warc_filename(
    dest_prefix: &str,
    writer_id: usize,
    sequence: u64,
    writer_subprefix: Option<&str>,
    gzip: bool,
) -> String {
    let mut name = format!("{}-", dest_prefix);
    if let Some(sub) = writer_subprefix {
        name.push_str(sub);
        name.push('-');
    }
    name.push_str(&format!("{:06}-{:03}.extracted.warc", writer_id, sequence));
    if gzip {
        name.push_str(".gz");
    }
    name
}

/// Build a `resource` record from a file path plus an optional JSON
/// metadata sidecar (`warc_content_type`, `uri`, `warc_headers_dict`).
/// The record links back to its shard via `WARC-Warcinfo-ID`.
pub fn resource_record_from_path(
    file_path: &str,
    metadata_path: Option<&str>,
    warcinfo_id: &str,
) -> Result<WarcRecord, Error> {
    let file_bytes = std::fs::read(file_path)?;

    let mut content_type: Option<String> = None;
    let mut uri: Option<String> = None;
    let mut extra_headers: Vec<(String, String)> = Vec::new();

    if let Some(metadata_path) = metadata_path {
        if !metadata_path.ends_with(".json") {
            return Err(Error::BadMetadataPath(metadata_path.to_string()));
        }
        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&std::fs::read(metadata_path)?)?;

        content_type = metadata
            .get("warc_content_type")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        uri = metadata
            .get("uri")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(serde_json::Value::Object(headers)) = metadata.get("warc_headers_dict") {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    extra_headers.push((k.clone(), v.to_string()));
                }
            }
        }
    }

    let guessed;
    let content_type = match content_type {
        Some(ct) => Some(ct),
        None => {
            guessed = mime_guess::from_path(file_path).first_raw();
            guessed.map(str::to_string)
        }
    };
    let uri = uri.unwrap_or_else(|| file_path.to_string());
    extra_headers.push(("WARC-Warcinfo-ID".to_string(), warcinfo_id.to_string()));

    Ok(WarcRecord::resource(
        &uri,
        content_type.as_deref(),
        extra_headers,
        Bytes::from(file_bytes),
        settings::now(),
    ))
}

/// Configuration for a [`WarcFilter`] run.
#[derive(Clone, Debug)]
pub struct WarcFilterConfig {
    pub cdx_paths: Vec<String>,
    pub prefix_path: String,
    pub writer_info: Vec<(String, String)>,
    pub writer_subprefix: Option<String>,
    pub write_paths_as_resource_records: Vec<String>,
    pub write_paths_as_resource_records_metadata: Vec<String>,
    pub record_limit: u64,
    pub log_every_n: u64,
    pub warc_download_prefix: Option<String>,
    pub n_parallel: usize,
    pub n_parallel_readers: Option<usize>,
    pub n_parallel_writers: Option<usize>,
    pub max_attempts: u32,
    pub base_backoff_seconds: f64,
    pub jobs_queue_size: usize,
    pub records_queue_size: usize,
    pub fetcher_to_consumer_ratio: usize,
    pub aws_region: Option<String>,
    pub gzip: bool,
    pub content_type: Option<String>,
    pub min_part_size: usize,
    pub max_file_size: u64,
}

impl Default for WarcFilterConfig {
    fn default() -> Self {
        Self {
            cdx_paths: Vec::new(),
            prefix_path: "TEST".to_string(),
            writer_info: Vec::new(),
            writer_subprefix: None,
            write_paths_as_resource_records: Vec::new(),
            write_paths_as_resource_records_metadata: Vec::new(),
            record_limit: 0,
            log_every_n: 1000,
            warc_download_prefix: None,
            n_parallel: 1,
            n_parallel_readers: None,
            n_parallel_writers: None,
            max_attempts: 5,
            base_backoff_seconds: 0.5,
            jobs_queue_size: DEFAULT_JOBS_QUEUE_SIZE,
            records_queue_size: DEFAULT_RECORDS_QUEUE_SIZE,
            fetcher_to_consumer_ratio: DEFAULT_FETCHER_TO_CONSUMER_RATIO,
            aws_region: None,
            gzip: true,
            content_type: None,
            min_part_size: MIN_PART_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl WarcFilterConfig {
    fn num_readers(&self) -> usize {
        self.n_parallel_readers.unwrap_or(self.n_parallel).max(1)
    }

    fn num_writers(&self) -> usize {
        match self.n_parallel_writers {
            Some(n) => n.max(1),
            None => (self.num_readers() / self.fetcher_to_consumer_ratio).max(1),
        }
    }

    fn needs_s3(&self) -> bool {
        self.cdx_paths.iter().any(|p| is_s3_url(p))
            || self
                .warc_download_prefix
                .as_deref()
                .map(is_s3_url)
                .unwrap_or(false)
            || is_s3_url(&self.prefix_path)
    }
}

/// Extract the WARC records addressed by CDX indexes into rotated output
/// shards.
pub struct WarcFilter {
    config: Arc<WarcFilterConfig>,
}

impl WarcFilter {
    pub fn new(config: WarcFilterConfig) -> Result<Self, Error> {
        if !config.write_paths_as_resource_records_metadata.is_empty()
            && config.write_paths_as_resource_records_metadata.len()
                != config.write_paths_as_resource_records.len()
        {
            return Err(Error::MismatchedResourcePaths);
        }
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Run the pipeline. An interrupt (ctrl-C) is caught, logged, and
    /// reported as -1.
    pub async fn filter(&self) -> Result<i64, Error> {
        tokio::select! {
            result = self.filter_async() => result.map(|n| n as i64),
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted by user.");
                Ok(-1)
            }
        }
    }

    pub async fn filter_async(&self) -> Result<u64, Error> {
        let s3_client = if self.config.needs_s3() {
            let mut loader =
                aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = &self.config.aws_region {
                loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
            }
            let shared = loader.load().await;
            Some(aws_sdk_s3::Client::new(&shared))
        } else {
            None
        };

        self.run_pipeline(s3_client).await
    }

    async fn run_pipeline(&self, s3_client: Option<aws_sdk_s3::Client>) -> Result<u64, Error> {
        let config = &self.config;
        let num_readers = config.num_readers();
        let num_writers = config.num_writers();
        log::info!(
            "Starting job generator, {} readers, {} writers",
            num_readers,
            num_writers
        );

        let (jobs_tx, jobs_rx) = flume::bounded::<JobMsg>(config.jobs_queue_size);
        let (records_tx, records_rx) = flume::bounded::<RecordMsg>(config.records_queue_size);

        let generator = tokio::spawn(generate_range_jobs(
            Arc::clone(config),
            jobs_tx,
            num_readers,
            s3_client.clone(),
        ));

        let readers: Vec<_> = (0..num_readers)
            .map(|reader_id| {
                tokio::spawn(read_warc_records(
                    reader_id,
                    Arc::clone(config),
                    jobs_rx.clone(),
                    records_tx.clone(),
                    s3_client.clone(),
                ))
            })
            .collect();
        drop(jobs_rx);
        drop(records_tx);

        let writers: Vec<_> = (0..num_writers)
            .map(|writer_id| {
                tokio::spawn(write_warc_records(
                    writer_id,
                    Arc::clone(config),
                    records_rx.clone(),
                    s3_client.clone(),
                ))
            })
            .collect();
        drop(records_rx);

        let jobs_submitted = generator
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))??;
        log::info!(
            "{} range jobs submitted, waiting for readers to finish",
            jobs_submitted
        );

        let mut reader_records: u64 = 0;
        let mut records_tx_for_stop = Vec::new();
        for handle in readers {
            let (tracker, stop_tx) = handle.await.map_err(|e| Error::TaskFailed(e.to_string()))?;
            reader_records += tracker.total_records;
            records_tx_for_stop.push(stop_tx);
        }
        log::info!("All WARC readers completed: {} records", reader_records);

        // shutdown coordination: the readers are done, so release the writers
        if let Some(stop_tx) = records_tx_for_stop.into_iter().next() {
            for _ in 0..num_writers {
                stop_tx.send_async(RecordMsg::Stop).await?;
            }
        }

        let mut writer_records: u64 = 0;
        for handle in writers {
            let tracker = handle.await.map_err(|e| Error::TaskFailed(e.to_string()))??;
            writer_records += tracker.total_records;
        }
        log::info!("All WARC writers completed: {} records", writer_records);

        Ok(writer_records)
    }
}

/// Stage 1: stream the CDX inputs, turning each line into a RangeJob.
/// Posts one STOP per reader at end of input.
async fn generate_range_jobs(
    config: Arc<WarcFilterConfig>,
    jobs_tx: flume::Sender<JobMsg>,
    num_readers: usize,
    s3_client: Option<aws_sdk_s3::Client>,
) -> Result<u64, Error> {
    log::info!("Range job limit: {}", config.record_limit);
    let warc_download_prefix = config.warc_download_prefix.clone().unwrap_or_default();

    let mut count: u64 = 0;
    'outer: for index_path in &config.cdx_paths {
        let lines = match open_cdx_lines(
            index_path,
            s3_client.as_ref(),
            config.max_attempts,
            config.base_backoff_seconds,
        )
        .await
        {
            Ok(lines) => lines,
            Err(e) => {
                log::error!("Failed to read CDX index from {}: {}", index_path, e);
                continue;
            }
        };

        for line in lines {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Failed reading CDX index {}: {}", index_path, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let job = match read_cdx_line(&line, &warc_download_prefix) {
                Ok(job) => job,
                Err(_) => {
                    log::error!("Invalid CDX line: {}", line);
                    continue;
                }
            };
            jobs_tx.send_async(JobMsg::Job(job)).await?;
            count += 1;

            if config.record_limit > 0 && count >= config.record_limit {
                log::warn!("Record limit reached at {}", count);
                break 'outer;
            }
        }
        log::info!("CDX completed from {}", index_path);
    }

    // signal readers to stop
    for _ in 0..num_readers {
        jobs_tx.send_async(JobMsg::Stop).await?;
    }
    log::info!("Enqueued {} jobs", count);
    Ok(count)
}

/// Stage 2: pop jobs, issue ranged reads, push payloads. A failed job is
/// logged and dropped; it never kills the reader.
async fn read_warc_records(
    reader_id: usize,
    config: Arc<WarcFilterConfig>,
    jobs_rx: flume::Receiver<JobMsg>,
    records_tx: flume::Sender<RecordMsg>,
    s3_client: Option<aws_sdk_s3::Client>,
) -> (ThroughputTracker, flume::Sender<RecordMsg>) {
    let mut tracker = ThroughputTracker::start();
    let mut counter: u64 = 0;

    while let Ok(msg) = jobs_rx.recv_async().await {
        let job = match msg {
            JobMsg::Stop => break,
            JobMsg::Job(job) => job,
        };
        match job
            .ranged_get_bytes(
                config.max_attempts,
                config.base_backoff_seconds,
                s3_client.as_ref(),
            )
            .await
        {
            Ok(data) => {
                tracker.add(data.len() as u64, job.records_count);
                counter += 1;

                if config.log_every_n > 0 && counter % config.log_every_n == 0 {
                    log::info!(
                        "WARC reader {}: {} items, {:.1} MB, {:.2} MB/s, {:.2} req/s",
                        reader_id,
                        counter,
                        tracker.total_bytes as f64 / (1024.0 * 1024.0),
                        tracker.mb_per_sec(),
                        tracker.requests_per_sec(),
                    );
                }

                if records_tx
                    .send_async(RecordMsg::Payload(RangePayload { job, data }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                log::warn!(
                    "WARC reader {} failed on {} [{},{}]: {}",
                    reader_id,
                    job.url,
                    job.offset,
                    job.length,
                    e
                );
            }
        }
    }

    log::info!(
        "WARC reader {} stopping. Stats: {:.1}s, {} requests, {:.1} MB, {:.2} MB/s, {:.2} req/s",
        reader_id,
        tracker.elapsed(),
        tracker.total_requests,
        tracker.total_bytes as f64 / (1024.0 * 1024.0),
        tracker.mb_per_sec(),
        tracker.requests_per_sec(),
    );
    (tracker, records_tx)
}

/// Open shard `sequence` for `writer_id` and write its warcinfo record
/// (plus the caller's resource records, which repeat on every shard so
/// each is independently interpretable). Returns the writer, the bytes
/// written so far, and the warcinfo record id.
async fn new_shard_with_header(
    writer_id: usize,
    sequence: u64,
    config: &WarcFilterConfig,
    s3_client: Option<&aws_sdk_s3::Client>,
) -> Result<(ShardWriter, u64, String), Error> {
    let (mut writer, filename) = if is_s3_url(&config.prefix_path) {
        let (bucket, key_prefix) = parse_s3_uri(&config.prefix_path)?;
        let filename = generate_warc_filename(
            &key_prefix,
            writer_id,
            sequence,
            config.writer_subprefix.as_deref(),
            config.gzip,
        );
        let client = s3_client.ok_or(Error::S3(s3::Error::NotS3(
            "no S3 client for an s3:// output".to_string(),
        )))?;
        let mut shard = S3ShardWriter::new(
            client.clone(),
            &bucket,
            &filename,
            config.content_type.as_deref(),
            config.min_part_size,
            config.max_attempts,
            config.base_backoff_seconds,
        );
        shard.start().await?;
        (ShardWriter::S3(shard), filename)
    } else {
        let filename = generate_warc_filename(
            &config.prefix_path,
            writer_id,
            sequence,
            config.writer_subprefix.as_deref(),
            config.gzip,
        );
        log::info!("opening new warc file {}", filename);
        let file = tokio::fs::File::create(&filename).await?;
        (
            ShardWriter::Local(tokio::io::BufWriter::new(file)),
            filename,
        )
    };

    let basename = Path::new(&filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.clone());
    let warcinfo = WarcRecord::warcinfo(&basename, &config.writer_info, settings::now());
    let warcinfo_id = warcinfo.record_id().unwrap_or_default().to_string();
    let header = warcinfo.serialize(config.gzip)?;
    writer.write(&header).await?;
    let mut written = header.len() as u64;

    for (i, resource_path) in config.write_paths_as_resource_records.iter().enumerate() {
        log::info!("Writing resource record from {}", resource_path);
        let metadata_path = config
            .write_paths_as_resource_records_metadata
            .get(i)
            .map(String::as_str);
        let record = resource_record_from_path(resource_path, metadata_path, &warcinfo_id)?;
        let data = record.serialize(config.gzip)?;
        writer.write(&data).await?;
        written += data.len() as u64;
    }

    Ok((writer, written, warcinfo_id))
}

/// Stage 3: each writer owns one rotating shard. When the next record
/// would push the shard past the size budget, the shard is closed and the
/// next sequence starts.
async fn write_warc_records(
    writer_id: usize,
    config: Arc<WarcFilterConfig>,
    records_rx: flume::Receiver<RecordMsg>,
    s3_client: Option<aws_sdk_s3::Client>,
) -> Result<ThroughputTracker, Error> {
    let mut sequence: u64 = 1;
    let (mut writer, mut current_size, _) =
        new_shard_with_header(writer_id, sequence, &config, s3_client.as_ref()).await?;

    let mut tracker = ThroughputTracker::start();
    let mut counter: u64 = 0;

    let result: Result<(), Error> = async {
        while let Ok(msg) = records_rx.recv_async().await {
            let payload = match msg {
                RecordMsg::Stop => break,
                RecordMsg::Payload(payload) => payload,
            };
            counter += 1;

            if config.max_file_size > 0
                && current_size + payload.data.len() as u64 > config.max_file_size
            {
                let (new_writer, header_size, _) =
                    new_shard_with_header(writer_id, sequence + 1, &config, s3_client.as_ref())
                        .await?;
                let old = std::mem::replace(&mut writer, new_writer);
                old.close().await?;
                sequence += 1;
                current_size = header_size;
                log::info!(
                    "Rotated writer {} to sequence {} due to size limit",
                    writer_id,
                    sequence
                );
            }

            writer.write(&payload.data).await?;
            current_size += payload.data.len() as u64;
            tracker.add(payload.data.len() as u64, payload.job.records_count);

            if config.log_every_n > 0 && counter % config.log_every_n == 0 {
                log::info!(
                    "WARC writer {}: {} items, {:.1} MB written, {:.2} MB/s",
                    writer_id,
                    counter,
                    tracker.total_bytes as f64 / (1024.0 * 1024.0),
                    tracker.mb_per_sec(),
                );
            }
        }
        Ok(())
    }
    .await;

    writer.close().await?;
    result?;

    log::info!(
        "WARC writer {} stopping. Stats: {:.1}s, {} items, {:.1} MB written, {:.2} MB/s",
        writer_id,
        tracker.elapsed(),
        tracker.total_records,
        tracker.total_bytes as f64 / (1024.0 * 1024.0),
        tracker.mb_per_sec(),
    );
    Ok(tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn cdx_line_to_range_job() {
        let line = concat!(
            "com,example)/ 20240722120756 ",
            "{\"url\": \"http://example.com/\", \"status\": \"200\", \"offset\": \"3499\", ",
            "\"length\": \"689\", \"filename\": ",
            "\"crawl-data/CC-MAIN-2024-30/segments/x/warc/CC-MAIN-x-00443.warc.gz\"}"
        );
        let job = read_cdx_line(line, "https://data.commoncrawl.org").unwrap();
        assert_eq!(
            job.url,
            "https://data.commoncrawl.org/crawl-data/CC-MAIN-2024-30/segments/x/warc/CC-MAIN-x-00443.warc.gz"
        );
        assert_eq!(job.offset, 3499);
        assert_eq!(job.length, 689);
        assert_eq!(job.records_count, 1);
        assert!(!job.is_s3());
    }

    #[test]
    fn bad_cdx_lines() {
        assert!(read_cdx_line("too short", "p").is_err());
        assert!(read_cdx_line("a b {\"no\": \"ranges\"}", "p").is_err());
        assert!(read_cdx_line("a b not-json", "p").is_err());
    }

    #[test]
    fn parallelism_defaults() {
        let config = WarcFilterConfig {
            n_parallel: 12,
            ..WarcFilterConfig::default()
        };
        assert_eq!(config.num_readers(), 12);
        assert_eq!(config.num_writers(), 2); // 12 / ratio 6

        let config = WarcFilterConfig {
            n_parallel: 1,
            ..WarcFilterConfig::default()
        };
        assert_eq!(config.num_writers(), 1);

        let config = WarcFilterConfig {
            n_parallel: 4,
            n_parallel_readers: Some(8),
            n_parallel_writers: Some(3),
            ..WarcFilterConfig::default()
        };
        assert_eq!(config.num_readers(), 8);
        assert_eq!(config.num_writers(), 3);
    }

    #[test]
    fn s3_detection_in_config() {
        let config = WarcFilterConfig {
            prefix_path: "s3://bucket/prefix".to_string(),
            ..WarcFilterConfig::default()
        };
        assert!(config.needs_s3());

        let config = WarcFilterConfig {
            warc_download_prefix: Some("s3://commoncrawl".to_string()),
            ..WarcFilterConfig::default()
        };
        assert!(config.needs_s3());

        let config = WarcFilterConfig::default();
        assert!(!config.needs_s3());
    }

    fn payload(size: usize) -> RangePayload {
        RangePayload {
            job: RangeJob {
                url: "https://data.commoncrawl.org/x.warc.gz".to_string(),
                offset: 0,
                length: size as u64,
                records_count: 1,
            },
            data: Bytes::from(vec![b'x'; size]),
        }
    }

    #[tokio::test]
    async fn writer_shard_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("PREFIX").to_string_lossy().into_owned();
        let config = Arc::new(WarcFilterConfig {
            prefix_path: prefix,
            writer_info: vec![("software".to_string(), "cdxt-rs test".to_string())],
            max_file_size: 100 * 1024,
            gzip: true,
            ..WarcFilterConfig::default()
        });

        let (tx, rx) = flume::bounded::<RecordMsg>(16);
        let writer = tokio::spawn(write_warc_records(0, Arc::clone(&config), rx, None));

        for _ in 0..10 {
            tx.send_async(RecordMsg::Payload(payload(30 * 1024)))
                .await
                .unwrap();
        }
        tx.send_async(RecordMsg::Stop).await.unwrap();

        let tracker = writer.await.unwrap().unwrap();
        assert_eq!(tracker.total_records, 10);
        assert_eq!(tracker.total_bytes, 10 * 30 * 1024);

        // three 30 KiB payloads fit under the 100 KiB budget per shard
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "PREFIX-000000-001.extracted.warc.gz",
                "PREFIX-000000-002.extracted.warc.gz",
                "PREFIX-000000-003.extracted.warc.gz",
                "PREFIX-000000-004.extracted.warc.gz",
            ]
        );

        // each shard leads with a warcinfo record (the first gzip member)
        for name in names {
            let file = std::fs::File::open(dir.path().join(name)).unwrap();
            let mut decoder = GzDecoder::new(file);
            let mut first_member = String::new();
            decoder.read_to_string(&mut first_member).unwrap();
            assert!(first_member.contains("WARC-Type: warcinfo"));
        }
    }

    #[tokio::test]
    async fn resource_records_repeat_on_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("whitelist.txt");
        std::fs::write(&resource, b"com,example)/\n").unwrap();

        let prefix = dir.path().join("OUT").join("W").to_string_lossy().into_owned();
        std::fs::create_dir_all(dir.path().join("OUT")).unwrap();
        let config = Arc::new(WarcFilterConfig {
            prefix_path: prefix,
            write_paths_as_resource_records: vec![resource.to_string_lossy().into_owned()],
            max_file_size: 50 * 1024,
            gzip: false,
            ..WarcFilterConfig::default()
        });

        let (tx, rx) = flume::bounded::<RecordMsg>(16);
        let writer = tokio::spawn(write_warc_records(0, Arc::clone(&config), rx, None));
        for _ in 0..4 {
            tx.send_async(RecordMsg::Payload(payload(30 * 1024)))
                .await
                .unwrap();
        }
        tx.send_async(RecordMsg::Stop).await.unwrap();
        writer.await.unwrap().unwrap();

        let shards: Vec<_> = std::fs::read_dir(dir.path().join("OUT")).unwrap().collect();
        assert!(shards.len() >= 2);
        for shard in shards {
            let contents = std::fs::read(shard.unwrap().path()).unwrap();
            let text = String::from_utf8_lossy(&contents);
            let warcinfo_at = text.find("WARC-Type: warcinfo").unwrap();
            let resource_at = text.find("WARC-Type: resource").unwrap();
            assert!(warcinfo_at < resource_at);
            // the resource record links back to this shard's warcinfo
            let id_at = text.find("WARC-Warcinfo-ID: <urn:uuid:").unwrap();
            assert!(id_at > resource_at);
        }
    }

    #[tokio::test]
    async fn generator_honors_record_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cdx = dir.path().join("index.cdx");
        let mut lines = String::new();
        for i in 0..10 {
            lines.push_str(&format!(
                "com,example)/{} 20240101000000 {{\"filename\": \"f.warc.gz\", \"offset\": \"{}\", \"length\": \"10\"}}\n",
                i,
                i * 100
            ));
        }
        std::fs::write(&cdx, lines).unwrap();

        let config = Arc::new(WarcFilterConfig {
            cdx_paths: vec![cdx.to_string_lossy().into_owned()],
            warc_download_prefix: Some("https://data.commoncrawl.org".to_string()),
            record_limit: 3,
            ..WarcFilterConfig::default()
        });

        let (tx, rx) = flume::bounded::<JobMsg>(100);
        let submitted = generate_range_jobs(config, tx, 2, None).await.unwrap();
        assert_eq!(submitted, 3);

        let mut jobs = 0;
        let mut stops = 0;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                JobMsg::Job(_) => jobs += 1,
                JobMsg::Stop => stops += 1,
            }
        }
        assert_eq!(jobs, 3);
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn generator_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cdx = dir.path().join("index.cdx");
        std::fs::write(
            &cdx,
            concat!(
                "com,example)/a 2024 {\"filename\": \"f.warc.gz\", \"offset\": \"0\", \"length\": \"10\"}\n",
                "garbage\n",
                "com,example)/b 2024 {\"filename\": \"f.warc.gz\", \"offset\": \"10\", \"length\": \"10\"}\n",
            ),
        )
        .unwrap();

        let config = Arc::new(WarcFilterConfig {
            cdx_paths: vec![cdx.to_string_lossy().into_owned()],
            warc_download_prefix: Some("https://data.commoncrawl.org".to_string()),
            ..WarcFilterConfig::default()
        });

        let (tx, rx) = flume::bounded::<JobMsg>(100);
        let submitted = generate_range_jobs(config, tx, 1, None).await.unwrap();
        assert_eq!(submitted, 2);
        drop(rx);
    }
}
