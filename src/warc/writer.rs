//! The rotated local WARC writer used by the `warc` subcommand: each output
//! file starts with a `warcinfo` record and is closed once it grows past
//! the target size.

use super::record::WarcRecord;
use crate::settings;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_WARC_SIZE: u64 = 1_000_000_000;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Record(#[from] super::record::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct WarcWriter {
    prefix: String,
    subprefix: Option<String>,
    info: Vec<(String, String)>,
    warc_size: u64,
    gzip: bool,
    segment: u64,
    current: Option<(File, PathBuf, u64)>,
}

impl WarcWriter {
    pub fn new(
        prefix: &str,
        subprefix: Option<&str>,
        info: Vec<(String, String)>,
        warc_size: Option<u64>,
        gzip: bool,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            subprefix: subprefix.map(str::to_string),
            info,
            warc_size: warc_size.unwrap_or(DEFAULT_WARC_SIZE),
            gzip,
            segment: 0,
            current: None,
        }
    }

    fn unique_warc_filename(&mut self) -> PathBuf {
        loop {
            let mut name = format!("{}-", self.prefix);
            if let Some(sub) = &self.subprefix {
                name.push_str(sub);
                name.push('-');
            }
            name.push_str(&format!("{:06}.extracted.warc", self.segment));
            if self.gzip {
                name.push_str(".gz");
            }
            if Path::new(&name).exists() {
                self.segment += 1;
            } else {
                return PathBuf::from(name);
            }
        }
    }

    fn start_new_warc(&mut self) -> Result<(), Error> {
        let path = self.unique_warc_filename();
        let mut fd = File::create(&path)?;
        log::info!("opening new warc file {}", path.display());

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let warcinfo = WarcRecord::warcinfo(&filename, &self.info, settings::now());
        let data = warcinfo.serialize(self.gzip)?;
        fd.write_all(&data)?;

        self.current = Some((fd, path, data.len() as u64));
        Ok(())
    }

    pub fn write_record(&mut self, record: &WarcRecord) -> Result<(), Error> {
        if self.current.is_none() {
            self.start_new_warc()?;
        }
        let data = record.serialize(self.gzip)?;
        let (fd, _, size) = self
            .current
            .as_mut()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "writer lost its open file",
                ))
            })?;
        fd.write_all(&data)?;
        *size += data.len() as u64;

        if *size > self.warc_size {
            self.current = None;
            self.segment += 1;
        }
        Ok(())
    }

    pub fn current_filename(&self) -> Option<&Path> {
        self.current.as_ref().map(|(_, path, _)| path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(size: usize) -> WarcRecord {
        WarcRecord::resource(
            "file:test",
            Some("application/octet-stream"),
            Vec::new(),
            Bytes::from(vec![b'x'; size]),
            0,
        )
    }

    #[test]
    fn rotation_and_warcinfo() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("TEST").to_string_lossy().into_owned();
        let info = vec![("software".to_string(), "cdxt-rs test".to_string())];

        // two ~6 KB records fit under the 10 KB budget before rotation
        let mut writer = WarcWriter::new(&prefix, None, info, Some(10_000), false);
        for _ in 0..5 {
            writer.write_record(&record(6_000)).unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "TEST-000000.extracted.warc",
                "TEST-000001.extracted.warc",
                "TEST-000002.extracted.warc"
            ]
        );

        // every shard leads with a warcinfo record
        for name in names {
            let contents = std::fs::read(dir.path().join(name)).unwrap();
            let text = String::from_utf8_lossy(&contents);
            let warcinfo_at = text.find("WARC-Type: warcinfo").unwrap();
            let resource_at = text.find("WARC-Type: resource").unwrap_or(usize::MAX);
            assert!(warcinfo_at < resource_at);
        }
    }

    #[test]
    fn subprefix_and_probing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("CC").to_string_lossy().into_owned();

        // occupy the first filename; the writer must skip to segment 1
        std::fs::write(format!("{}-sub-000000.extracted.warc", prefix), b"taken").unwrap();

        let mut writer = WarcWriter::new(&prefix, Some("sub"), Vec::new(), None, false);
        writer.write_record(&record(10)).unwrap();
        assert!(writer
            .current_filename()
            .unwrap()
            .to_string_lossy()
            .ends_with("CC-sub-000001.extracted.warc"));
    }
}
