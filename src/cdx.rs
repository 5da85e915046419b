//! The CDX fetcher: resolves a logical query to an ordered endpoint list,
//! pages through each endpoint, and yields normalized captures.

use crate::capture::{Capture, CaptureObject};
use crate::commoncrawl::{self, apply_cc_defaults, filter_cc_endpoints, CcSort, DEFAULT_CC_MIRROR};
use crate::compat::{munge_fields, munge_filter};
use crate::myrequests::{self, FetchResponse, GetOpts};
use crate::settings;
use crate::timeutils::validate_timestamp;
use futures::{Stream, TryStreamExt};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_GET_LIMIT: i64 = 1000;

/// No way to get this from the API without fetching a page.
pub const LINES_PER_PAGE: i64 = 3000;

const IA_CDX_ENDPOINT: &str = "https://web.archive.org/cdx/search/cdx";
const IA_WAYBACK: &str = "https://web.archive.org/web";

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not understand source {0}")]
    UnknownSource(String),
    #[error("configuration error: {0}")]
    Config(&'static str),
    #[error("cannot decode response, first bytes are {0}")]
    BadCdxResponse(String),
    #[error("surprised by showNumPages value of {0}")]
    BadNumPages(String),
    #[error(transparent)]
    Http(#[from] myrequests::Error),
    #[error(transparent)]
    CommonCrawl(#[from] commoncrawl::Error),
    #[error(transparent)]
    Compat(#[from] crate::compat::Error),
    #[error(transparent)]
    Time(#[from] crate::timeutils::Error),
}

/// A logical CDX query. Fields map one-for-one onto query parameters; the
/// `from_ts` spelling is rewritten to `from` at the HTTP layer.
#[derive(Clone, Debug, Default)]
pub struct CdxParams {
    pub url: Option<String>,
    pub from_ts: Option<String>,
    pub to: Option<String>,
    pub closest: Option<String>,
    pub limit: Option<i64>,
    pub filter: Vec<String>,
    pub match_type: Option<String>,
    pub sort: Option<String>,
    pub fl: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub show_num_pages: bool,
}

impl CdxParams {
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        let mut push = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                query.push((k.to_string(), v));
            }
        };
        push("url", self.url.clone());
        push("output", Some("json".to_string()));
        push("from_ts", self.from_ts.clone());
        push("to", self.to.clone());
        push("closest", self.closest.clone());
        push("limit", self.limit.map(|v| v.to_string()));
        push("matchType", self.match_type.clone());
        push("sort", self.sort.clone());
        push("fl", self.fl.clone());
        push("page", self.page.map(|v| v.to_string()));
        push("pageSize", self.page_size.map(|v| v.to_string()));
        if self.show_num_pages {
            push("showNumPages", Some("true".to_string()));
        }
        for f in &self.filter {
            query.push(("filter".to_string(), f.clone()));
        }
        query
    }

    fn validate(&self) -> Result<(), Error> {
        for value in [&self.from_ts, &self.to, &self.closest].into_iter().flatten() {
            validate_timestamp(value)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Source {
    CommonCrawl,
    InternetArchive,
    Custom(String),
}

impl Source {
    /// The dialect tag the compat layer keys on.
    fn tag(&self) -> &str {
        match self {
            Source::CommonCrawl => "cc",
            Source::InternetArchive => "ia",
            Source::Custom(_) => "custom",
        }
    }
}

/// Construction options for a [`CDXFetcher`].
#[derive(Clone, Debug, Default)]
pub struct FetcherConfig {
    /// `cc`, `ia`, or a raw CDX endpoint URL.
    pub source: String,
    /// Wayback prefix for content replays.
    pub wb: Option<String>,
    /// Common Crawl index mirror.
    pub cc_mirror: Option<String>,
    /// Endpoint ordering for CC queries.
    pub cc_sort: CcSort,
    /// Explicit crawl selection (already normalized).
    pub crawl: Option<Vec<String>>,
    /// Prefix for direct WARC record downloads.
    pub warc_download_prefix: Option<String>,
}

pub struct CDXFetcher {
    source: Source,
    raw_index_list: Vec<String>,
    cc_sort: CcSort,
    crawl: Option<Vec<String>>,
    wb: Option<String>,
    warc_download_prefix: Option<String>,
}

/// What one page fetch did to the iteration state.
enum Advance {
    Records(Vec<Capture>),
    NextEndpoint,
    Exhausted,
}

struct IterState {
    params: CdxParams,
    index_list: Vec<String>,
    endpoint: usize,
    page: i64,
    remaining: Option<i64>,
}

impl IterState {
    async fn advance(&mut self) -> Result<Advance, Error> {
        if matches!(self.remaining, Some(r) if r <= 0) {
            return Ok(Advance::Exhausted);
        }
        if self.endpoint >= self.index_list.len() {
            return Ok(Advance::Exhausted);
        }

        self.page += 1;
        self.params.page = Some(self.page);
        self.params.limit = self.remaining;

        let endpoint = self.index_list[self.endpoint].clone();
        let resp = myrequests::get(
            &endpoint,
            &self.params.to_query(),
            None,
            GetOpts {
                cdx: true,
                allow404: false,
            },
        )
        .await?;

        // pywb signals "page too far" with a 400; ia signals the last page
        // with an empty body; a 404 means no captures at all
        if resp.status == 400 {
            self.endpoint += 1;
            self.page = -1;
            return Ok(Advance::NextEndpoint);
        }
        let mut records = cdx_to_json(&resp)?;
        if records.is_empty() {
            self.endpoint += 1;
            self.page = -1;
            return Ok(Advance::NextEndpoint);
        }

        if let Some(remaining) = self.remaining.as_mut() {
            // a server that ignores limit= must not overrun the caller's cap
            records.truncate((*remaining).max(0) as usize);
            *remaining -= records.len() as i64;
        }
        Ok(Advance::Records(
            records.into_iter().map(Capture::from_map).collect(),
        ))
    }
}

impl CDXFetcher {
    pub async fn new(config: FetcherConfig) -> Result<Self, Error> {
        let source = match config.source.as_str() {
            "cc" => Source::CommonCrawl,
            "ia" => Source::InternetArchive,
            s if s.starts_with("https://") || s.starts_with("http://") => {
                Source::Custom(s.to_string())
            }
            other => return Err(Error::UnknownSource(other.to_string())),
        };

        if config.crawl.is_some() && source != Source::CommonCrawl {
            return Err(Error::Config("crawl selection only works with --cc"));
        }
        if config.wb.is_some() && config.warc_download_prefix.is_some() {
            return Err(Error::Config(
                "wayback and warc_download_prefix are mutually exclusive",
            ));
        }

        let cc_mirror = config
            .cc_mirror
            .clone()
            .unwrap_or_else(|| DEFAULT_CC_MIRROR.to_string());

        let (raw_index_list, wb, warc_download_prefix) = match &source {
            Source::CommonCrawl => {
                let endpoints = commoncrawl::get_cc_endpoints(&cc_mirror).await?;
                let prefix = config.warc_download_prefix.clone().unwrap_or_else(|| {
                    if cc_mirror.starts_with("s3:") {
                        "s3://commoncrawl".to_string()
                    } else {
                        "https://commoncrawl.s3.amazonaws.com".to_string()
                    }
                });
                (endpoints, config.wb.clone(), Some(prefix))
            }
            Source::InternetArchive => {
                let wb = config
                    .wb
                    .clone()
                    .or_else(|| Some(IA_WAYBACK.to_string()));
                (vec![IA_CDX_ENDPOINT.to_string()], wb, None)
            }
            Source::Custom(url) => (
                vec![url.clone()],
                config.wb.clone(),
                config.warc_download_prefix.clone(),
            ),
        };

        Ok(Self {
            source,
            raw_index_list,
            cc_sort: config.cc_sort,
            crawl: config.crawl,
            wb,
            warc_download_prefix,
        })
    }

    /// The WARC download prefix in effect, if any.
    pub fn warc_download_prefix(&self) -> Option<&str> {
        self.warc_download_prefix.as_deref()
    }

    /// Normalize the caller's params and resolve the endpoint list for one
    /// query.
    fn prepare(&self, url: &str, params: &CdxParams) -> Result<(CdxParams, Vec<String>), Error> {
        let mut params = params.clone();
        params.url = Some(url.to_string());
        params.validate()?;
        params.filter = munge_filter(&params.filter, self.source.tag())?;

        let index_list = match self.source {
            Source::CommonCrawl => {
                apply_cc_defaults(&mut params, self.crawl.is_some(), settings::mock_time())?;
                filter_cc_endpoints(
                    &self.raw_index_list,
                    self.cc_sort,
                    &mut params,
                    self.crawl.as_deref(),
                )?
            }
            _ => self.raw_index_list.clone(),
        };
        Ok((params, index_list))
    }

    fn capture_object(&self, capture: Capture) -> CaptureObject {
        CaptureObject::new(
            capture,
            self.wb.clone(),
            self.warc_download_prefix.clone(),
        )
    }

    /// Eager query: every endpoint is asked once, honoring `limit`
    /// (defaulted to 1000 here, unlike `iter`).
    pub async fn get(&self, url: &str, params: &CdxParams) -> Result<Vec<CaptureObject>, Error> {
        let (mut params, index_list) = self.prepare(url, params)?;
        let mut remaining = params.limit.unwrap_or(DEFAULT_GET_LIMIT);

        let mut ret = Vec::new();
        for endpoint in &index_list {
            params.limit = Some(remaining);
            let resp = myrequests::get(
                endpoint,
                &params.to_query(),
                None,
                GetOpts {
                    cdx: true,
                    allow404: false,
                },
            )
            .await?;
            if resp.status == 400 {
                continue;
            }
            let records = cdx_to_json(&resp)?;
            remaining -= records.len() as i64;
            ret.extend(
                records
                    .into_iter()
                    .map(|map| self.capture_object(Capture::from_map(map))),
            );
            if remaining <= 0 {
                break;
            }
        }
        Ok(ret)
    }

    /// Lazy query: a stream that pages through each endpoint in order.
    /// Ordering is endpoint order, then page order, then in-page order.
    pub fn iter<'a>(
        &'a self,
        url: &str,
        params: &CdxParams,
    ) -> Result<impl Stream<Item = Result<CaptureObject, Error>> + 'a, Error> {
        if params.page.is_some() {
            return Err(Error::Config("must not set page in a CDX iterator"));
        }
        let (params, index_list) = self.prepare(url, params)?;
        let remaining = params.limit;

        let state = IterState {
            params,
            index_list,
            endpoint: 0,
            page: -1,
            remaining,
        };

        Ok(futures::stream::try_unfold(state, |mut state| async move {
            loop {
                match state.advance().await? {
                    Advance::Records(captures) => {
                        return Ok::<_, Error>(Some((captures, state)))
                    }
                    Advance::NextEndpoint => continue,
                    Advance::Exhausted => return Ok(None),
                }
            }
        })
        .map_ok(move |captures| {
            futures::stream::iter(
                captures
                    .into_iter()
                    .map(|c| Ok(self.capture_object(c)))
                    .collect::<Vec<_>>(),
            )
        })
        .try_flatten())
    }

    /// Sum `showNumPages` over the endpoints. Returns the total (as pages
    /// or as estimated samples) plus a per-endpoint breakdown.
    pub async fn get_size_estimate(
        &self,
        url: &str,
        params: &CdxParams,
        as_pages: bool,
    ) -> Result<(i64, Vec<(String, i64)>), Error> {
        let (mut params, index_list) = self.prepare(url, params)?;
        params.show_num_pages = true;
        params.limit = None;

        let mut pages: i64 = 0;
        let mut details = Vec::new();
        for endpoint in &index_list {
            let resp = myrequests::get(
                endpoint,
                &params.to_query(),
                None,
                GetOpts {
                    cdx: true,
                    allow404: false,
                },
            )
            .await?;
            if resp.status == 200 {
                let endpoint_pages = show_num_pages(&resp)?;
                pages += endpoint_pages;
                details.push((endpoint.clone(), endpoint_pages));
            }
            // silently ignore empty answers
        }

        let total = if as_pages {
            pages
        } else {
            pages_to_samples(pages)
        };
        Ok((total, details))
    }
}

/// Decode a CDX response body into normalized capture maps. Handles both
/// wire shapes: pywb JSON lines and IA's list-of-lists. A 404 (and an
/// empty body) decodes to no captures.
pub fn cdx_to_json(resp: &FetchResponse) -> Result<Vec<BTreeMap<String, String>>, Error> {
    if resp.status == 404 {
        return Ok(Vec::new());
    }

    let text = resp.text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('{') {
        // pywb output=json is jsonl
        let mut ret = Vec::new();
        for line in trimmed.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let obj: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
                .map_err(|_| Error::BadCdxResponse(snippet(line)))?;
            let mut map = BTreeMap::new();
            for (k, v) in obj {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                map.insert(crate::compat::to_pywb(&k).to_string(), value);
            }
            ret.push(map);
        }
        return Ok(ret);
    }

    if !trimmed.starts_with('[') {
        return Err(Error::BadCdxResponse(snippet(trimmed)));
    }

    // ia output=json is a json list of lists; the first row is field names
    let mut rows: Vec<Vec<String>> =
        serde_json::from_str(trimmed).map_err(|_| Error::BadCdxResponse(snippet(trimmed)))?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let fields = rows.remove(0);
    Ok(munge_fields(&fields, &rows))
}

fn snippet(text: &str) -> String {
    text.chars().take(50).collect()
}

/// Decode a `showNumPages` response: pywb answers with a JSON object
/// carrying a `blocks` count, IA with a bare integer.
pub fn show_num_pages(resp: &FetchResponse) -> Result<i64, Error> {
    let text = resp.text();
    let value: serde_json::Value = serde_json::from_str(text.trim())
        .map_err(|_| Error::BadNumPages(snippet(text.trim())))?;
    match value {
        serde_json::Value::Object(map) => Ok(map
            .get("blocks")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)),
        serde_json::Value::Number(n) if n.is_i64() => Ok(n.as_i64().unwrap_or(0)),
        other => Err(Error::BadNumPages(other.to_string())),
    }
}

/// Convert a page count to an estimated number of captures, adjusting for
/// the partial pages at the start and end.
pub fn pages_to_samples(pages: i64) -> i64 {
    let adjusted = if pages > 1 {
        pages as f64 - 1.0
    } else if pages >= 1 {
        pages as f64 - 0.5
    } else {
        pages as f64
    };
    (adjusted * LINES_PER_PAGE as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;

    fn resp(status: u16, body: &str) -> FetchResponse {
        FetchResponse::for_tests(status, Bytes::copy_from_slice(body.as_bytes()), HeaderMap::new())
    }

    #[test]
    fn pywb_jsonl_bodies() {
        let body = concat!(
            "{\"urlkey\": \"com,example)/\", \"original\": \"http://example.com/\", ",
            "\"statuscode\": \"200\", \"mimetype\": \"text/html\", \"length\": \"689\"}\n",
            "{\"original\": \"http://example.com/x\", \"statuscode\": \"404\"}\n",
        );
        let records = cdx_to_json(&resp(200, body)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["url"], "http://example.com/");
        assert_eq!(records[0]["status"], "200");
        assert_eq!(records[0]["mime"], "text/html");
        assert_eq!(records[0]["urlkey"], "com,example)/");
        assert_eq!(records[1]["status"], "404");
    }

    #[test]
    fn ia_list_of_lists() {
        let body = r#"[["original","statuscode"],["http://example.com/","200"]]"#;
        let records = cdx_to_json(&resp(200, body)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["url"], "http://example.com/");
        assert_eq!(records[0]["status"], "200");
    }

    #[test]
    fn empty_bodies() {
        assert!(cdx_to_json(&resp(404, "{\"error\": \"No Captures found\"}"))
            .unwrap()
            .is_empty());
        assert!(cdx_to_json(&resp(200, "")).unwrap().is_empty());
        assert!(cdx_to_json(&resp(200, "[]")).unwrap().is_empty());
    }

    #[test]
    fn garbage_bodies() {
        assert!(matches!(
            cdx_to_json(&resp(200, "<html>oops</html>")),
            Err(Error::BadCdxResponse(_))
        ));
    }

    #[test]
    fn num_pages_both_dialects() {
        assert_eq!(show_num_pages(&resp(200, "{\"blocks\": 3}")).unwrap(), 3);
        assert_eq!(show_num_pages(&resp(200, "3")).unwrap(), 3);
        assert!(show_num_pages(&resp(200, "\"3\"")).is_err());
    }

    #[test]
    fn page_sample_estimates() {
        assert_eq!(pages_to_samples(0), 0);
        assert_eq!(pages_to_samples(1), 1500);
        assert_eq!(pages_to_samples(2), 3000);
        assert_eq!(pages_to_samples(10), 27000);
    }

    #[tokio::test]
    async fn unknown_source_rejected() {
        let config = FetcherConfig {
            source: "gopher".to_string(),
            ..FetcherConfig::default()
        };
        assert!(matches!(
            CDXFetcher::new(config).await,
            Err(Error::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn conflicting_content_sources_rejected() {
        let config = FetcherConfig {
            source: "https://cdx.example.com/cdx".to_string(),
            wb: Some("https://wb.example.com/web".to_string()),
            warc_download_prefix: Some("https://warc.example.com".to_string()),
            ..FetcherConfig::default()
        };
        assert!(matches!(
            CDXFetcher::new(config).await,
            Err(Error::Config(_))
        ));
    }
}
