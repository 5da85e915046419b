//! Filter CDX index files against a SURT prefix whitelist.
//!
//! Each input file is processed independently by a worker-pool thread:
//! read a line, take the characters up to the first space (the SURT),
//! keep or drop the whole line. Outputs mirror the input directory layout;
//! empty outputs are deleted.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no files found matching glob pattern: {0}")]
    NoInputFiles(String),
    #[error("bad glob pattern: {0}")]
    BadGlob(#[from] glob::PatternError),
    #[error("filter file not found: {0}")]
    FilterFileNotFound(PathBuf),
    #[error("output file already exists: {0}; use --overwrite to overwrite existing files")]
    OutputExists(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The matching approaches expose the same contract and are
/// interchangeable; the trie wins for large whitelists, the tuple is
/// simplest.
pub trait Matcher: Send + Sync {
    /// True when `text` starts with any whitelisted prefix.
    fn matches(&self, text: &str) -> bool;
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    is_end: bool,
}

pub struct TrieMatcher {
    root: TrieNode,
}

impl TrieMatcher {
    pub fn new<S: AsRef<str>>(prefixes: &[S]) -> Self {
        log::info!("Building trie matcher based on {} inputs", prefixes.len());
        let mut root = TrieNode::default();
        for prefix in prefixes {
            let mut node = &mut root;
            for c in prefix.as_ref().chars() {
                node = node.children.entry(c).or_default();
            }
            node.is_end = true;
        }
        Self { root }
    }
}

impl Matcher for TrieMatcher {
    fn matches(&self, text: &str) -> bool {
        let mut node = &self.root;
        for c in text.chars() {
            match node.children.get(&c) {
                Some(child) => node = child,
                None => return false,
            }
            if node.is_end {
                return true;
            }
        }
        false
    }
}

pub struct TupleMatcher {
    prefixes: Vec<String>,
}

impl TupleMatcher {
    pub fn new<S: AsRef<str>>(prefixes: &[S]) -> Self {
        log::info!("Building tuple matcher based on {} inputs", prefixes.len());
        Self {
            prefixes: prefixes.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }
}

impl Matcher for TupleMatcher {
    fn matches(&self, text: &str) -> bool {
        self.prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchingApproach {
    Trie,
    Tuple,
}

pub fn build_matcher<S: AsRef<str>>(
    approach: MatchingApproach,
    prefixes: &[S],
) -> Box<dyn Matcher> {
    match approach {
        MatchingApproach::Trie => Box::new(TrieMatcher::new(prefixes)),
        MatchingApproach::Tuple => Box::new(TupleMatcher::new(prefixes)),
    }
}

/// Minimal URL to SURT conversion for whitelist entries: reverse the host,
/// drop the scheme and default port, keep the path as a prefix. A trailing
/// `*` wildcard is dropped (prefix matching subsumes it).
pub fn url_to_surt(url: &str) -> String {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let (hostport, path) = match without_scheme.find('/') {
        Some(i) => (&without_scheme[..i], &without_scheme[i..]),
        None => (without_scheme, ""),
    };

    let host = hostport
        .rsplit_once(':')
        .filter(|(_, port)| *port == "80" || *port == "443")
        .map(|(host, _)| host)
        .unwrap_or(hostport)
        .to_ascii_lowercase();

    let reversed: Vec<&str> = host.split('.').rev().collect();
    let path = path.trim_end_matches('*');

    format!("{}){}", reversed.join(","), path)
}

/// Expand the input glob and produce parallel output paths preserving the
/// relative layout under `output_base`.
pub fn resolve_paths(
    input_base: &str,
    input_glob: Option<&str>,
    output_base: &str,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), Error> {
    let Some(input_glob) = input_glob else {
        return Ok((
            vec![PathBuf::from(input_base)],
            vec![PathBuf::from(output_base)],
        ));
    };

    let full_glob = format!("{}{}", input_base, input_glob);
    let mut inputs: Vec<PathBuf> = glob::glob(&full_glob)?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    inputs.sort();
    if inputs.is_empty() {
        return Err(Error::NoInputFiles(full_glob));
    }

    let base = Path::new(input_base);
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let rel = input.strip_prefix(base).unwrap_or(input);
        outputs.push(Path::new(output_base).join(rel));
    }
    Ok((inputs, outputs))
}

/// Refuse to clobber existing outputs unless asked; create parent dirs.
pub fn validate_resolved_paths(output_paths: &[PathBuf], overwrite: bool) -> Result<(), Error> {
    for output in output_paths {
        if !overwrite && output.exists() {
            return Err(Error::OutputExists(output.clone()));
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Load whitelist prefixes, one per line; `url` entries are converted to
/// SURT form.
pub fn load_filter_file(path: &Path, filter_is_url: bool) -> Result<Vec<String>, Error> {
    if !path.exists() {
        return Err(Error::FilterFileNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    let mut prefixes: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if filter_is_url {
        prefixes = prefixes.iter().map(|u| url_to_surt(u)).collect();
    }
    log::info!("Loaded {} filter entries", prefixes.len());
    Ok(prefixes)
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read + Send>, Error> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn create_maybe_gz(path: &Path) -> Result<Box<dyn Write + Send>, Error> {
    let file = File::create(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(GzEncoder::new(file, Compression::default())))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

const LOG_EVERY_N_LINES: u64 = 100_000;

/// Process one input/output pair. Returns (lines seen, lines included).
pub fn process_single_file(
    input_path: &Path,
    output_path: &Path,
    matcher: &dyn Matcher,
    limit: u64,
) -> Result<(u64, u64), Error> {
    log::info!("Reading index from {}", input_path.display());
    log::info!("Writing filter output to {}", output_path.display());

    let reader = BufReader::new(open_maybe_gz(input_path)?);
    let mut writer = create_maybe_gz(output_path)?;

    let mut lines_n: u64 = 0;
    let mut included_n: u64 = 0;
    for line in reader.lines() {
        let line = line?;
        lines_n += 1;

        // we do not need to parse the full line
        let surt = match line.find(' ') {
            Some(i) => &line[..i],
            None => line.as_str(),
        };

        if matcher.matches(surt) {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            included_n += 1;
            if limit > 0 && included_n >= limit {
                log::info!(
                    "Limit reached at {} from {}",
                    limit,
                    input_path.display()
                );
                break;
            }
        }

        if lines_n % LOG_EVERY_N_LINES == 0 {
            log::info!(
                "Lines completed: {} (matched: {}) from {}",
                lines_n,
                included_n,
                input_path.display()
            );
        }
    }
    writer.flush()?;
    drop(writer);

    if included_n == 0 {
        log::warn!(
            "Output file is empty, removing it: {}",
            output_path.display()
        );
        std::fs::remove_file(output_path)?;
    }

    Ok((lines_n, included_n))
}

/// Run the filter over all input/output pairs on a worker pool of
/// `n_parallel` threads. Per-file errors are counted, not fatal.
/// Returns (total lines, total included, total errors).
pub fn filter_cdx(
    matcher: &dyn Matcher,
    input_paths: &[PathBuf],
    output_paths: &[PathBuf],
    n_parallel: usize,
    limit: u64,
) -> Result<(u64, u64, u64), Error> {
    log::info!(
        "Filtering with {} workers in parallel (limit: {})",
        n_parallel,
        limit
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_parallel.max(1))
        .build()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let pairs: Vec<(&PathBuf, &PathBuf)> = input_paths.iter().zip(output_paths.iter()).collect();
    let results: Vec<(u64, u64, u64)> = pool.install(|| {
        pairs
            .par_iter()
            .map(|(input, output)| match process_single_file(input, output, matcher, limit) {
                Ok((lines, included)) => {
                    log::info!(
                        "File statistics: included {} / {} lines: {}",
                        included,
                        lines,
                        input.display()
                    );
                    (lines, included, 0)
                }
                Err(e) => {
                    log::error!("Error filtering {}: {}", input.display(), e);
                    (0, 0, 1)
                }
            })
            .collect()
    });

    let totals = results
        .into_iter()
        .fold((0, 0, 0), |acc, r| (acc.0 + r.0, acc.1 + r.1, acc.2 + r.2));
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIXES: [&str; 3] = ["com,example)/", "org,commoncrawl)/faq", "com,pbm)"];

    fn matchers() -> Vec<Box<dyn Matcher>> {
        vec![
            build_matcher(MatchingApproach::Trie, &PREFIXES),
            build_matcher(MatchingApproach::Tuple, &PREFIXES),
        ]
    }

    #[test]
    fn matcher_equivalence() {
        let cases = [
            ("com,example)/", true),
            ("com,example)/index.html", true),
            ("com,example", false),
            ("org,commoncrawl)/", false),
            ("org,commoncrawl)/faq.html", true),
            ("com,pbm)/anything", true),
            ("", false),
            ("net,other)/", false),
        ];
        for matcher in matchers() {
            for (text, expected) in cases {
                assert_eq!(matcher.matches(text), expected, "text={:?}", text);
            }
        }
    }

    #[test]
    fn surt_conversion() {
        assert_eq!(url_to_surt("https://example.com/foo"), "com,example)/foo");
        assert_eq!(url_to_surt("http://Example.COM:80/foo"), "com,example)/foo");
        assert_eq!(url_to_surt("example.com"), "com,example)");
        assert_eq!(
            url_to_surt("https://www.example.com/a/*"),
            "com,example,www)/a/"
        );
    }

    fn write_gz(path: &Path, lines: &[&str]) {
        let mut enc = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        for line in lines {
            enc.write_all(line.as_bytes()).unwrap();
            enc.write_all(b"\n").unwrap();
        }
        enc.finish().unwrap();
    }

    fn read_gz(path: &Path) -> Vec<String> {
        let mut out = String::new();
        MultiGzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out.lines().map(str::to_string).collect()
    }

    #[test]
    fn end_to_end_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let in_dir = dir.path().join("in");
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(in_dir.join("sub")).unwrap();

        write_gz(
            &in_dir.join("a.cdx.gz"),
            &[
                "com,example)/ 20180101000000 {\"url\": \"http://example.com/\"}",
                "net,other)/ 20180101000000 {\"url\": \"http://other.net/\"}",
                "com,example)/page 20180102000000 {\"url\": \"http://example.com/page\"}",
            ],
        );
        // nothing in this one matches, so its output must be deleted
        write_gz(
            &in_dir.join("sub").join("b.cdx.gz"),
            &["net,other)/x 20180101000000 {}"],
        );

        let (inputs, outputs) = resolve_paths(
            &in_dir.to_string_lossy(),
            Some("/**/*.cdx.gz"),
            &out_dir.to_string_lossy(),
        )
        .unwrap();
        assert_eq!(inputs.len(), 2);
        validate_resolved_paths(&outputs, false).unwrap();

        let matcher = TupleMatcher::new(&["com,example)/"]);
        let (lines, included, errors) =
            filter_cdx(&matcher, &inputs, &outputs, 2, 0).unwrap();
        assert_eq!(lines, 4);
        assert_eq!(included, 2);
        assert_eq!(errors, 0);

        let kept = read_gz(&out_dir.join("a.cdx.gz"));
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|l| l.starts_with("com,example)/")));

        // empty output was removed, layout is preserved otherwise
        assert!(!out_dir.join("sub").join("b.cdx.gz").exists());
    }

    #[test]
    fn limit_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.cdx.gz");
        let output = dir.path().join("out.cdx.gz");
        write_gz(
            &input,
            &[
                "com,example)/1 x {}",
                "com,example)/2 x {}",
                "com,example)/3 x {}",
            ],
        );

        let matcher = TrieMatcher::new(&["com,example)/"]);
        let (lines, included) = process_single_file(&input, &output, &matcher, 2).unwrap();
        assert_eq!(included, 2);
        assert!(lines >= 2);
        assert_eq!(read_gz(&output).len(), 2);
    }

    #[test]
    fn overwrite_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("out.cdx.gz");
        std::fs::write(&existing, b"occupied").unwrap();

        let outputs = vec![existing.clone()];
        assert!(matches!(
            validate_resolved_paths(&outputs, false),
            Err(Error::OutputExists(_))
        ));
        assert!(validate_resolved_paths(&outputs, true).is_ok());
    }
}
