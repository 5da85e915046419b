//! A single capture and its lazily-fetched content.
//!
//! The CDX wire formats are open-ended dictionaries, so a capture is the
//! handful of fields every consumer needs plus an extras map for whatever
//! else the server sent. Field names are pywb-normalized before they get
//! here; see the compat module.

use crate::myrequests;
use crate::warc::{fetch_warc_record, fetch_wb_warc, WarcRecord};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no content source configured; build the fetcher with a wayback or warc prefix")]
    NoContentSource,
    #[error(transparent)]
    Fetch(#[from] crate::warc::fetch::Error),
    #[error(transparent)]
    Http(#[from] myrequests::Error),
}

#[derive(Clone, Debug, Default)]
pub struct Capture {
    pub url: Option<String>,
    pub timestamp: Option<String>,
    pub status: Option<String>,
    pub mime: Option<String>,
    pub digest: Option<String>,
    pub length: Option<String>,
    pub offset: Option<String>,
    pub filename: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Capture {
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        let mut capture = Capture::default();
        for (k, v) in map {
            match k.as_str() {
                "url" => capture.url = Some(v),
                "timestamp" => capture.timestamp = Some(v),
                "status" => capture.status = Some(v),
                "mime" => capture.mime = Some(v),
                "digest" => capture.digest = Some(v),
                "length" => capture.length = Some(v),
                "offset" => capture.offset = Some(v),
                "filename" => capture.filename = Some(v),
                _ => {
                    capture.extra.insert(k, v);
                }
            }
        }
        capture
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        let known = match field {
            "url" => self.url.as_deref(),
            "timestamp" => self.timestamp.as_deref(),
            "status" => self.status.as_deref(),
            "mime" => self.mime.as_deref(),
            "digest" => self.digest.as_deref(),
            "length" => self.length.as_deref(),
            "offset" => self.offset.as_deref(),
            "filename" => self.filename.as_deref(),
            _ => None,
        };
        known.or_else(|| self.extra.get(field).map(String::as_str))
    }

    /// All populated fields, sorted by name. Useful for printing.
    pub fn fields(&self) -> BTreeMap<&str, &str> {
        let mut map: BTreeMap<&str, &str> = self
            .extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for field in [
            "url",
            "timestamp",
            "status",
            "mime",
            "digest",
            "length",
            "offset",
            "filename",
        ] {
            if let Some(v) = self.get(field) {
                map.insert(field, v);
            }
        }
        map
    }

    pub fn is_revisit(&self) -> bool {
        self.mime.as_deref() == Some("warc/revisit")
    }
}

/// A capture plus the configuration needed to turn it into bytes: a
/// wayback prefix, a WARC download prefix, or neither (CDX-only).
/// The underlying WARC record and its decoded content are fetched once
/// and cached.
pub struct CaptureObject {
    pub capture: Capture,
    wb: Option<String>,
    warc_download_prefix: Option<String>,
    warc_record: Option<WarcRecord>,
    content: Option<Bytes>,
}

impl CaptureObject {
    pub fn new(capture: Capture, wb: Option<String>, warc_download_prefix: Option<String>) -> Self {
        Self {
            capture,
            wb,
            warc_download_prefix,
            warc_record: None,
            content: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.capture.get(field)
    }

    pub fn is_revisit(&self) -> bool {
        self.capture.is_revisit()
    }

    /// Fetch (once) the WARC record behind this capture. The wayback path
    /// wins when both sources are somehow configured.
    pub async fn fetch_warc_record(&mut self) -> Result<&WarcRecord, Error> {
        if self.warc_record.is_none() {
            let record = if self.wb.is_some() {
                fetch_wb_warc(&self.capture, self.wb.as_deref(), "id_").await?
            } else if let Some(prefix) = self.warc_download_prefix.as_deref() {
                fetch_warc_record(&self.capture, prefix).await?
            } else {
                return Err(Error::NoContentSource);
            };
            self.warc_record = Some(record);
        }
        Ok(self
            .warc_record
            .as_ref()
            .expect("record cached by the lines above"))
    }

    /// The HTTP body of the record's payload, cached after the first call.
    pub async fn content(&mut self) -> Result<Bytes, Error> {
        if self.content.is_none() {
            let record = self.fetch_warc_record().await?;
            let payload = record.payload();
            // payload is an HTTP header block followed by the body
            let body = match crate::warc::record::find_crlf_crlf(payload) {
                Some(pos) => payload.slice(pos + 4..),
                None => payload.clone(),
            };
            self.content = Some(body);
        }
        Ok(self
            .content
            .as_ref()
            .expect("content cached by the lines above")
            .clone())
    }

    /// A fresh re-readable stream over the (cached) content bytes.
    pub async fn content_stream(&mut self) -> Result<Cursor<Bytes>, Error> {
        Ok(Cursor::new(self.content().await?))
    }

    pub async fn text(&mut self) -> Result<String, Error> {
        let content = self.content().await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn known_and_extra_fields() {
        let capture = Capture::from_map(map(&[
            ("url", "http://example.com/"),
            ("status", "200"),
            ("languages", "eng"),
        ]));
        assert_eq!(capture.get("url"), Some("http://example.com/"));
        assert_eq!(capture.get("status"), Some("200"));
        assert_eq!(capture.get("languages"), Some("eng"));
        assert_eq!(capture.get("nope"), None);

        let fields = capture.fields();
        assert_eq!(
            fields.keys().copied().collect::<Vec<_>>(),
            vec!["languages", "status", "url"]
        );
    }

    #[test]
    fn revisit_detection() {
        let capture = Capture::from_map(map(&[("mime", "warc/revisit")]));
        assert!(capture.is_revisit());
        let capture = Capture::from_map(map(&[("mime", "text/html")]));
        assert!(!capture.is_revisit());
    }

    #[tokio::test]
    async fn no_content_source() {
        let capture = Capture::from_map(map(&[("url", "http://example.com/")]));
        let mut obj = CaptureObject::new(capture, None, None);
        assert!(matches!(
            obj.fetch_warc_record().await,
            Err(Error::NoContentSource)
        ));
    }
}
