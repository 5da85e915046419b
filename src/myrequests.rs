//! The single HTTP entry point shared by every network-facing part of the
//! crate: CDX queries, collinfo fetches, WARC byte-range reads, and wayback
//! playback.
//!
//! All requests to a given host observe a minimum inter-request interval,
//! tracked in a process-wide table. Retryable statuses back off
//! exponentially; connection errors sleep a long fixed interval and are
//! counted against a ceiling. DNS failures on hostnames never seen to work
//! are fatal immediately.

use crate::settings;
use bytes::Bytes;
use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{redirect, Client, StatusCode};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const TCP_KEEPALIVE: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_MAX_SEC: f64 = 60.0;
const CONNECT_ERROR_SLEEP: Duration = Duration::from_secs(60);

const RETRYABLE_STATUSES: [u16; 6] = [429, 500, 502, 503, 504, 509];

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid hostname in url {0}")]
    BadHostname(String),
    #[error("invalid url of some sort, status={status} {url}")]
    BadUrl { status: u16, url: String },
    #[error("unexpected status {status} for {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("{count} connection failures for url {url}: {last}")]
    TooManyConnectionErrors {
        count: u32,
        url: String,
        last: String,
    },
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// A completed request. In cdx mode a 400 or 404 is returned as-is and the
/// caller interprets the (empty) body.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
    headers: HeaderMap,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[cfg(test)]
    pub(crate) fn for_tests(status: u16, body: Bytes, headers: HeaderMap) -> Self {
        Self {
            status,
            body,
            headers,
        }
    }
}

/// Request option flags, named for the CDX-specific status interpretation.
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOpts {
    /// 400 and 404 mean "no captures", not an error.
    pub cdx: bool,
    /// 404 is an acceptable answer (wayback playback of a 404 capture).
    pub allow404: bool,
}

struct HostPacing {
    next_fetch: f64,
    min_interval: f64,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

lazy_static! {
    static ref HOST_PACING: Mutex<HashMap<String, HostPacing>> = {
        let now = epoch_now();
        let mut table = HashMap::new();
        for (host, interval) in [
            ("index.commoncrawl.org", *settings::CC_INDEX_MIN_RETRY_INTERVAL),
            ("data.commoncrawl.org", *settings::CC_DATA_MIN_RETRY_INTERVAL),
            ("web.archive.org", *settings::IA_MIN_RETRY_INTERVAL),
        ] {
            table.insert(
                host.to_string(),
                HostPacing {
                    next_fetch: now,
                    min_interval: interval,
                },
            );
        }
        Mutex::new(table)
    };
    static ref SEEN_HOSTNAMES: Mutex<HashSet<String>> = Mutex::new(
        [
            "commoncrawl.s3.amazonaws.com",
            "data.commoncrawl.org",
            "web.archive.org",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    );
    static ref CLIENT: Client = Client::builder()
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .redirect(redirect::Policy::none())
        .build()
        .expect("reqwest client construction cannot fail with static config");
}

fn hostname_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// We have a DNS error; should we fail immediately?
fn dns_fatal(url: &str) -> bool {
    match hostname_of(url) {
        Some(host) => !SEEN_HOSTNAMES
            .lock()
            .expect("hostname set poisoned")
            .contains(&host),
        None => true,
    }
}

fn mark_hostname_seen(url: &str) {
    if let Some(host) = hostname_of(url) {
        SEEN_HOSTNAMES
            .lock()
            .expect("hostname set poisoned")
            .insert(host);
    }
}

/// Reserve a request slot for the host, returning (seconds to sleep before
/// sending, the host's minimum interval).
fn reserve_slot(url: &str) -> (f64, f64) {
    let host = hostname_of(url).unwrap_or_default();
    let now = epoch_now();
    let mut table = HOST_PACING.lock().expect("host pacing table poisoned");
    let entry = table.entry(host).or_insert_with(|| HostPacing {
        next_fetch: now,
        min_interval: *settings::DEFAULT_MIN_RETRY_INTERVAL,
    });
    let wait = (entry.next_fetch - now).max(0.0);
    entry.next_fetch = entry.next_fetch.max(now) + entry.min_interval;
    (wait, entry.min_interval)
}

/// Push the host's next allowed fetch out past any retries this call made.
fn release_slot(url: &str) {
    let host = hostname_of(url).unwrap_or_default();
    let now = epoch_now();
    let mut table = HOST_PACING.lock().expect("host pacing table poisoned");
    if let Some(entry) = table.get_mut(&host) {
        entry.next_fetch = now + entry.min_interval;
    }
}

fn is_dns_error(e: &reqwest::Error) -> bool {
    if !e.is_connect() {
        return false;
    }
    let mut text = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        text.push_str(&inner.to_string());
        source = std::error::Error::source(inner);
    }
    let text = text.to_ascii_lowercase();
    text.contains("dns") || text.contains("name or service not known")
}

/// Rewrite internal parameter names to the wire form: `from_ts` is how the
/// rest of the crate spells the CDX `from` parameter.
fn wire_params(params: &[(String, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| {
            if k == "from_ts" {
                ("from".to_string(), v.clone())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

pub async fn get(
    url: &str,
    params: &[(String, String)],
    headers: Option<HeaderMap>,
    opts: GetOpts,
) -> Result<FetchResponse, Error> {
    let (wait, min_interval) = reserve_slot(url);
    if wait > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    }

    let params = wire_params(params);

    let mut headers = headers.unwrap_or_default();
    if !headers.contains_key(USER_AGENT) {
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("cdxt-rs/", env!("CARGO_PKG_VERSION"))),
        );
    }

    let result = get_with_retries(url, &params, &headers, opts, min_interval).await;

    if result.is_ok() {
        mark_hostname_seen(url);
    }
    // in case we had a lot of retries, etc
    release_slot(url);

    result
}

async fn get_with_retries(
    url: &str,
    params: &[(String, String)],
    headers: &HeaderMap,
    opts: GetOpts,
    min_interval: f64,
) -> Result<FetchResponse, Error> {
    let mut retry_sec = 2.0 * min_interval;
    let mut retries: u32 = 0;
    let mut connect_errors: u32 = 0;

    loop {
        log::debug!("getting {} {:?}", url, params);
        let sent = CLIENT
            .get(url)
            .query(params)
            .headers(headers.clone())
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                connect_errors += 1;
                let desc = format!(
                    "{} failures for url {} {:?}: {}",
                    connect_errors, url, params, e
                );

                if is_dns_error(&e) && dns_fatal(url) {
                    return Err(Error::BadHostname(url.to_string()));
                }
                if connect_errors > *settings::MAX_ERRORS || settings::test_failfast() {
                    log::error!("{}", desc);
                    return Err(Error::TooManyConnectionErrors {
                        count: connect_errors,
                        url: url.to_string(),
                        last: e.to_string(),
                    });
                }
                if connect_errors > *settings::WARNING_AFTER_N_ERRORS {
                    log::warn!("{}", desc);
                }
                log::info!("retrying after {:.2}s for {}", RETRY_MAX_SEC, e);
                tokio::time::sleep(CONNECT_ERROR_SLEEP).await;
                continue;
            }
        };

        let status = resp.status();
        let code = status.as_u16();

        if opts.cdx && (code == 400 || code == 404) {
            // 400: html error page -- probably page= is too big -- not an error
            // 404: {'error': 'No Captures found for: ...'} -- not an error
            log::debug!("giving up with status {}, no captures found", code);
            return finish(resp).await;
        }
        if opts.allow404 && code == 404 {
            return finish(resp).await;
        }
        if RETRYABLE_STATUSES.contains(&code) {
            // 503=slow down, 50[24] are temporary outages, 500=S3 generic error,
            // 429 is another slow down
            retries += 1;
            let level = if retries > 5 {
                log::Level::Warn
            } else {
                log::Level::Info
            };
            log::log!(level, "retrying after {:.2}s for {}", retry_sec, code);
            if let Ok(text) = resp.text().await {
                if !text.is_empty() {
                    log::log!(level, "response body is {}", text);
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(retry_sec)).await;
            retry_sec = (retry_sec * 2.0).min(RETRY_MAX_SEC);
            continue;
        }
        if code == 400 || code == 404 {
            if let Ok(text) = resp.text().await {
                if !text.is_empty() {
                    log::info!("response body is {}", text);
                }
            }
            return Err(Error::BadUrl {
                status: code,
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let fragment: String = body.chars().take(200).collect();
            return Err(Error::UnexpectedStatus {
                status: code,
                url: url.to_string(),
                body: fragment,
            });
        }

        return finish(resp).await;
    }
}

async fn finish(resp: reqwest::Response) -> Result<FetchResponse, Error> {
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?;
    Ok(FetchResponse {
        status,
        body,
        headers,
    })
}

/// Retryable statuses, exposed so tests can assert the policy.
pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ts_is_rewritten() {
        let params = vec![
            ("from_ts".to_string(), "1998".to_string()),
            ("limit".to_string(), "10".to_string()),
        ];
        let wire = wire_params(&params);
        assert_eq!(wire[0].0, "from");
        assert_eq!(wire[1].0, "limit");
    }

    #[test]
    fn pacing_reservations_advance() {
        let url = "https://pacing-test.example.com/path";
        let (first_wait, interval) = reserve_slot(url);
        assert_eq!(first_wait, 0.0);
        assert_eq!(interval, *settings::DEFAULT_MIN_RETRY_INTERVAL);

        // A second reservation made immediately must wait out the interval,
        // and a third must wait roughly twice as long.
        let (second_wait, _) = reserve_slot(url);
        assert!(second_wait > 0.0 && second_wait <= interval);
        let (third_wait, _) = reserve_slot(url);
        assert!(third_wait > second_wait);

        // Completing a request brings the reservation back to one interval.
        release_slot(url);
        let (after_release, _) = reserve_slot(url);
        assert!(after_release <= interval);
    }

    #[test]
    fn known_hosts_are_preloaded() {
        let (_, interval) = reserve_slot("https://web.archive.org/cdx/search/cdx");
        assert_eq!(interval, *settings::IA_MIN_RETRY_INTERVAL);
        let (_, interval) = reserve_slot("https://index.commoncrawl.org/collinfo.json");
        assert_eq!(interval, *settings::CC_INDEX_MIN_RETRY_INTERVAL);
    }

    #[test]
    fn dns_fatality_depends_on_history() {
        assert!(!dns_fatal("https://web.archive.org/foo"));
        assert!(dns_fatal("https://never-seen-host.invalid/foo"));
    }
}
