//! Fetching the WARC record behind a single capture.
//!
//! Common Crawl exposes raw WARC files, so a capture's record is one HTTP
//! byte-range GET away. The Internet Archive does not; for wayback sources
//! the record is reconstructed ("vivified") from a playback response.

use super::record::{find_crlf_crlf, WarcRecord};
use crate::capture::Capture;
use crate::myrequests::{self, GetOpts};
use crate::settings;
use crate::timeutils::{http_date_to_time, time_to_iso_date};
use bytes::Bytes;
use flate2::read::GzDecoder;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use std::io::Read;
use thiserror::Error;

// Everything except characters that are safe in a URL path, matching the
// conservative quoting wayback itself uses.
const PATH_QUOTE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b':');

#[derive(Error, Debug)]
pub enum Error {
    #[error("capture must contain {0}")]
    MissingField(&'static str),
    #[error("no wayback configured")]
    NoWayback,
    #[error("invalid warc response record seen")]
    InvalidRecord,
    #[error("invalid end of warc block")]
    InvalidBlockEnd,
    #[error(transparent)]
    Record(#[from] super::record::Error),
    #[error(transparent)]
    Http(#[from] myrequests::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn required<'a>(capture: &'a Capture, field: &'static str) -> Result<&'a str, Error> {
    capture.get(field).ok_or(Error::MissingField(field))
}

/// Byte-range fetch of the record addressed by `filename`/`offset`/`length`,
/// relative to a WARC download prefix.
pub async fn fetch_warc_record(capture: &Capture, warc_prefix: &str) -> Result<WarcRecord, Error> {
    let url = required(capture, "url")?.to_string();
    let filename = required(capture, "filename")?;
    let offset: u64 = required(capture, "offset")?
        .parse()
        .map_err(|_| Error::MissingField("offset"))?;
    let length: u64 = required(capture, "length")?
        .parse()
        .map_err(|_| Error::MissingField("length"))?;

    let warc_url = format!("{}/{}", warc_prefix, filename);
    let range = format!("bytes={}-{}", offset, offset + length - 1);
    let mut headers = HeaderMap::new();
    headers.insert(
        RANGE,
        HeaderValue::from_str(&range).map_err(|_| Error::MissingField("offset"))?,
    );

    let resp = myrequests::get(&warc_url, &[], Some(headers), GetOpts::default()).await?;
    let mut record_bytes = resp.body.to_vec();

    // warc records are either not compressed or gzip, as of 1.0
    if record_bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(record_bytes.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        record_bytes = decompressed;
    }

    if record_bytes
        .windows(4)
        .filter(|w| **w == b"\r\n\r\n"[..])
        .count()
        < 3
    {
        return Err(Error::InvalidRecord);
    }

    let split = find_crlf_crlf(&record_bytes).ok_or(Error::InvalidRecord)?;
    let block = &record_bytes[split + 4..];
    if !block.ends_with(b"\r\n\r\n") {
        return Err(Error::InvalidBlockEnd);
    }
    let block = &block[..block.len() - 4];
    if find_crlf_crlf(block).is_none() {
        return Err(Error::InvalidRecord);
    }

    let mut record = WarcRecord::parse(&record_bytes)?;
    record.set_header("WARC-Source-URI", &warc_url);
    record.set_header("WARC-Source-Range", &range);

    match record.header("WARC-Target-URI") {
        Some(target) if target == url => {}
        Some(target) => log::warn!(
            "WARC-Target-URI {} does not match capture url {}",
            target,
            url
        ),
        None => log::warn!("record for {} has no WARC-Target-URI", url),
    }

    Ok(record)
}

/// Fetch a capture's content through a wayback and synthesize a WARC
/// response record from the playback. The `id_` modifier disables the
/// wayback's rewriting.
pub async fn fetch_wb_warc(
    capture: &Capture,
    wb: Option<&str>,
    modifier: &str,
) -> Result<WarcRecord, Error> {
    let url = required(capture, "url")?.to_string();
    let timestamp = required(capture, "timestamp")?.to_string();
    let status = required(capture, "status")?.to_string();

    let wb = wb.ok_or(Error::NoWayback)?;
    let wb_url = format!(
        "{}/{}{}/{}",
        wb,
        timestamp,
        modifier,
        utf8_percent_encode(&url, PATH_QUOTE)
    );

    // '-' is a revisit; it will 404 if the underlying record is a 404
    let allow404 = status == "404" || status == "-";
    let resp = myrequests::get(&wb_url, &[], None, GetOpts { cdx: false, allow404 }).await?;

    Ok(fake_wb_warc(&wb_url, resp, capture))
}

/// Given a playback from a wayback, fake up a warc response record.
fn fake_wb_warc(wb_url: &str, resp: myrequests::FetchResponse, capture: &Capture) -> WarcRecord {
    let url = capture.get("url").unwrap_or_default();
    let timestamp = capture.get("timestamp").unwrap_or_default();
    let capture_status = capture.get("status").unwrap_or_default();

    let mut status = resp.status;
    if status.to_string() != capture_status {
        if status == 200 && capture_status == "-" {
            log::warn!("revisit record vivified by wayback for {} {}", url, timestamp);
        } else if status == 200 && capture_status.starts_with('3') {
            log::warn!(
                "redirect capture came back 200, same-surt same-timestamp capture? {} {}",
                url,
                timestamp
            );
        } else if status == 302 && capture_status.starts_with('3') {
            // this is OK, wayback always sends a temporary redir
            if let Ok(orig) = capture_status.parse::<u16>() {
                status = orig;
            }
        } else {
            log::warn!(
                "surprised that status code is now={} orig={} {} {}",
                status,
                capture_status,
                url,
                timestamp
            );
        }
    }

    let mut http_headers: Vec<(String, String)> = Vec::new();
    let mut http_date = None;
    for (k, v) in resp.headers() {
        let Ok(v) = v.to_str() else {
            continue;
        };
        let name = k.as_str();
        let kl = name.to_ascii_lowercase();

        if kl == "x-archive-orig-date" {
            http_date = Some(v.to_string());
        }

        if let Some(stripped) = kl.strip_prefix("x-archive-orig-") {
            http_headers.push((stripped.to_string(), v.to_string()));
        } else if kl == "content-type" {
            http_headers.push(("Content-Type".to_string(), v.to_string()));
        } else if kl == "location" {
            // the wayback always rewrites this header
            let value = match v.split_once("_/http") {
                Some((_, rest)) => format!("http{}", rest),
                None => {
                    log::warn!("unexpected wayback location header: {}", v);
                    v.to_string()
                }
            };
            http_headers.push((name.to_string(), value));
        } else if kl.starts_with("x-archive-") {
            http_headers.push((name.to_string(), v.to_string()));
        } else {
            http_headers.push((format!("X-Archive-{}", name), v.to_string()));
        }
    }

    let mut payload = format!("HTTP/1.1 {} OK\r\n", status);
    for (k, v) in &http_headers {
        payload.push_str(k);
        payload.push_str(": ");
        payload.push_str(v);
        payload.push_str("\r\n");
    }
    payload.push_str("\r\n");
    let mut payload = payload.into_bytes();
    payload.extend_from_slice(&resp.body);

    let now = settings::now();
    let mut warc_headers = vec![
        ("WARC-Source-URI".to_string(), wb_url.to_string()),
        ("WARC-Creation-Date".to_string(), time_to_iso_date(now)),
    ];
    if let Some(date) = http_date {
        if let Ok(t) = http_date_to_time(&date) {
            warc_headers.push(("WARC-Date".to_string(), time_to_iso_date(t)));
        }
    }

    WarcRecord::response(url, warc_headers, Bytes::from(payload), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn capture(status: &str) -> Capture {
        let mut c = Capture::default();
        c.url = Some("http://example.com/".to_string());
        c.timestamp = Some("20180101000000".to_string());
        c.status = Some(status.to_string());
        c
    }

    fn playback(status: u16, headers: &[(&str, &str)], body: &[u8]) -> myrequests::FetchResponse {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                reqwest::header::HeaderValue::from_str(v).unwrap(),
            );
        }
        myrequests::FetchResponse::for_tests(status, Bytes::copy_from_slice(body), map)
    }

    #[test]
    fn vivified_record_unwraps_archive_headers() {
        let resp = playback(
            200,
            &[
                ("x-archive-orig-date", "Mon, 01 Jan 2018 00:00:00 GMT"),
                ("x-archive-orig-server", "Apache"),
                ("content-type", "text/html"),
                ("x-archive-guessed-charset", "utf-8"),
                ("server", "nginx"),
            ],
            b"<html></html>",
        );
        let record = fake_wb_warc("https://web.archive.org/web/x", resp, &capture("200"));

        assert_eq!(record.record_type(), Some("response"));
        assert_eq!(record.header("WARC-Date"), Some("2018-01-01T00:00:00Z"));
        assert_eq!(
            record.header("WARC-Source-URI"),
            Some("https://web.archive.org/web/x")
        );

        let payload = String::from_utf8(record.payload().to_vec()).unwrap();
        assert!(payload.starts_with("HTTP/1.1 200 OK\r\n"));
        // original headers are unwrapped, wayback's own headers are marked
        assert!(payload.contains("server: Apache\r\n"));
        assert!(payload.contains("X-Archive-server: nginx\r\n"));
        assert!(payload.contains("x-archive-guessed-charset: utf-8\r\n"));
        assert!(payload.ends_with("\r\n\r\n<html></html>"));
    }

    #[test]
    fn redirect_status_restored() {
        let resp = playback(
            302,
            &[("location", "https://web.archive.org/web/20180101id_/http://example.com/next")],
            b"",
        );
        let record = fake_wb_warc("https://web.archive.org/web/x", resp, &capture("301"));
        let payload = String::from_utf8(record.payload().to_vec()).unwrap();
        assert!(payload.starts_with("HTTP/1.1 301 OK\r\n"));
        assert!(payload.contains("location: http://example.com/next\r\n"));
    }
}
