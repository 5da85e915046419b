//! A minimal WARC record model: ordered headers plus an opaque payload.
//!
//! Serialization produces one WARC/1.0 record; with gzip enabled each
//! record is its own gzip member, so concatenating serialized records
//! yields a valid compressed WARC file.

use crate::digest::compute_digest;
use crate::timeutils::time_to_iso_date;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use thiserror::Error;
use uuid::Uuid;

const WARC_VERSION: &str = "WARC/1.0";

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid warc record: {0}")]
    InvalidRecord(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct WarcRecord {
    headers: Vec<(String, String)>,
    payload: Bytes,
}

fn record_id() -> String {
    format!("<urn:uuid:{}>", Uuid::new_v4())
}

impl WarcRecord {
    pub fn new(headers: Vec<(String, String)>, payload: Bytes) -> Self {
        Self { headers, payload }
    }

    /// The `warcinfo` record that leads every output file. `info` entries
    /// become `application/warc-fields` lines.
    pub fn warcinfo(filename: &str, info: &[(String, String)], now: i64) -> Self {
        let mut fields = String::new();
        for (k, v) in info {
            fields.push_str(k);
            fields.push_str(": ");
            fields.push_str(v);
            fields.push_str("\r\n");
        }
        let payload = Bytes::from(fields.into_bytes());

        let headers = vec![
            ("WARC-Type".to_string(), "warcinfo".to_string()),
            ("WARC-Record-ID".to_string(), record_id()),
            ("WARC-Filename".to_string(), filename.to_string()),
            ("WARC-Date".to_string(), time_to_iso_date(now)),
            (
                "Content-Type".to_string(),
                "application/warc-fields".to_string(),
            ),
        ];
        Self::new(headers, payload)
    }

    /// A `response` record whose payload is an HTTP header block plus body.
    /// Extra WARC headers from the caller are appended after the standard
    /// ones, last-wins for duplicates at read time.
    pub fn response(
        target_uri: &str,
        extra_warc_headers: Vec<(String, String)>,
        payload: Bytes,
        now: i64,
    ) -> Self {
        let mut headers = vec![
            ("WARC-Type".to_string(), "response".to_string()),
            ("WARC-Record-ID".to_string(), record_id()),
            ("WARC-Target-URI".to_string(), target_uri.to_string()),
            ("WARC-Date".to_string(), time_to_iso_date(now)),
            (
                "Content-Type".to_string(),
                "application/http; msgtype=response".to_string(),
            ),
            (
                "WARC-Block-Digest".to_string(),
                format!("sha1:{}", compute_digest(&payload)),
            ),
        ];
        for (k, v) in extra_warc_headers {
            // caller-supplied values replace the defaults
            if let Some(existing) = headers.iter_mut().find(|(ek, _)| ek.eq_ignore_ascii_case(&k)) {
                existing.1 = v;
            } else {
                headers.push((k, v));
            }
        }
        Self::new(headers, payload)
    }

    /// A `resource` record carrying an arbitrary file.
    pub fn resource(
        uri: &str,
        content_type: Option<&str>,
        extra_warc_headers: Vec<(String, String)>,
        payload: Bytes,
        now: i64,
    ) -> Self {
        let mut headers = vec![
            ("WARC-Type".to_string(), "resource".to_string()),
            ("WARC-Record-ID".to_string(), record_id()),
            ("WARC-Target-URI".to_string(), uri.to_string()),
            ("WARC-Date".to_string(), time_to_iso_date(now)),
            (
                "WARC-Block-Digest".to_string(),
                format!("sha1:{}", compute_digest(&payload)),
            ),
        ];
        if let Some(ct) = content_type {
            headers.push(("Content-Type".to_string(), ct.to_string()));
        }
        for (k, v) in extra_warc_headers {
            if let Some(existing) = headers.iter_mut().find(|(ek, _)| ek.eq_ignore_ascii_case(&k)) {
                existing.1 = v;
            } else {
                headers.push((k, v));
            }
        }
        Self::new(headers, payload)
    }

    pub fn record_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    pub fn record_id(&self) -> Option<&str> {
        self.header("WARC-Record-ID")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialize into WARC wire form, one gzip member if `gzip` is set.
    pub fn serialize(&self, gzip: bool) -> Result<Vec<u8>, Error> {
        let mut head = String::new();
        head.push_str(WARC_VERSION);
        head.push_str("\r\n");
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.payload.len()));
        head.push_str("\r\n");

        let mut raw = Vec::with_capacity(head.len() + self.payload.len() + 4);
        raw.extend_from_slice(head.as_bytes());
        raw.extend_from_slice(&self.payload);
        raw.extend_from_slice(b"\r\n\r\n");

        if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        } else {
            Ok(raw)
        }
    }

    /// Parse one uncompressed record: a WARC header block, a blank line,
    /// and the payload (trailing record separator tolerated).
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let split = find_crlf_crlf(bytes).ok_or(Error::InvalidRecord("no header terminator"))?;
        let (head, mut payload) = (&bytes[..split], &bytes[split + 4..]);
        if payload.ends_with(b"\r\n\r\n") {
            payload = &payload[..payload.len() - 4];
        }

        let head = std::str::from_utf8(head)
            .map_err(|_| Error::InvalidRecord("warc header block is not utf-8"))?;
        let mut lines = head.split("\r\n");
        let version = lines.next().unwrap_or_default();
        if !version.starts_with("WARC/") {
            return Err(Error::InvalidRecord("missing WARC version line"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once(':')
                .ok_or(Error::InvalidRecord("malformed warc header line"))?;
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }

        Ok(Self::new(headers, Bytes::copy_from_slice(payload)))
    }
}

pub(crate) fn find_crlf_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == &b"\r\n\r\n"[..])
}
