//! Code specific to the Common Crawl index: the collinfo catalog and its
//! on-disk cache, crawl-name selection, and time-based endpoint bisection.

use crate::cdx::CdxParams;
use crate::myrequests::{self, GetOpts};
use crate::settings;
use crate::timeutils::{
    cc_index_to_time, cc_index_to_time_special, pad_timestamp_up, time_to_timestamp,
    timestamp_to_time,
};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CC_MIRROR: &str = "https://index.commoncrawl.org/";

const COLLINFO_CACHE_TTL_SECS: u64 = 86400;
const THREE_MONTHS: i64 = 3 * 30 * 86400;
const ONE_YEAR: i64 = 365 * 86400;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Time(#[from] crate::timeutils::Error),
    #[error(transparent)]
    Http(#[from] myrequests::Error),
    #[error("error decoding collinfo.json: {0}")]
    BadCollinfo(#[from] serde_json::Error),
    #[error("surprisingly few endpoints for common crawl index ({0})")]
    SuspiciousCollinfo(usize),
    #[error("no matches for crawls {0}")]
    CrawlMismatch(String),
    #[error("if you specify an integer, only one crawl is allowed")]
    IntegerAmongCrawls,
    #[error("unknown cc_sort arg of {0}")]
    UnknownSort(String),
    #[error("cannot happen: {0}")]
    Internal(&'static str),
}

/// Order in which selected CC endpoints are queried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CcSort {
    Ascending,
    /// Reverse of ascending: newest crawl first. The default caller surface.
    Mixed,
}

impl Default for CcSort {
    fn default() -> Self {
        CcSort::Mixed
    }
}

impl FromStr for CcSort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascending" => Ok(CcSort::Ascending),
            "mixed" => Ok(CcSort::Mixed),
            other => Err(Error::UnknownSort(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct CollInfo {
    #[serde(rename = "cdx-api")]
    cdx_api: String,
}

/// Split comma-joined crawl args; a single integer means "the last N
/// crawls" and cannot be combined with named crawls.
pub fn normalize_crawl(crawl: &[String]) -> Result<Vec<String>, Error> {
    let mut crawls = Vec::new();
    for c in crawl {
        if c.contains(',') {
            crawls.extend(c.split(',').map(str::to_string));
        } else {
            crawls.push(c.clone());
        }
    }
    if crawls.len() > 1 && crawls.iter().any(|x| x.chars().all(|c| c.is_ascii_digit())) {
        return Err(Error::IntegerAmongCrawls);
    }
    Ok(crawls)
}

fn get_cache_names(cc_mirror: &str) -> Option<(PathBuf, String)> {
    lazy_static! {
        static ref NON_WORD: Regex = Regex::new(r"[^\w]").unwrap();
    }
    let cache = dirs::home_dir()?.join(".cache").join("cdx_toolkit");
    let stripped = cc_mirror.trim_start_matches("https://");
    let filename = NON_WORD.replace_all(stripped, "_").into_owned();
    Some((cache, filename))
}

fn check_collinfo_cache(cc_mirror: &str) -> Option<String> {
    let (cache, filename) = get_cache_names(cc_mirror)?;
    let path = cache.join(filename);
    let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(e) => {
            log::debug!("unable to get collinfo cache mtime: {:?}", e);
            return None;
        }
    };
    match mtime.elapsed() {
        Ok(age) if age.as_secs() < COLLINFO_CACHE_TTL_SECS => {
            match std::fs::read_to_string(&path) {
                Ok(body) => {
                    log::debug!("collinfo cache hit");
                    Some(body)
                }
                Err(e) => {
                    log::debug!("unable to read collinfo cache: {:?}", e);
                    None
                }
            }
        }
        _ => {
            log::debug!("collinfo cache too old");
            None
        }
    }
}

fn set_collinfo_cache(cc_mirror: &str, collinfo: &str) {
    let Some((cache, filename)) = get_cache_names(cc_mirror) else {
        return;
    };
    // temp-then-rename so a concurrent reader never sees a torn file
    let result = std::fs::create_dir_all(&cache).and_then(|_| {
        let tmp = cache.join(format!("{}.new", filename));
        std::fs::write(&tmp, collinfo)?;
        std::fs::rename(tmp, cache.join(&filename))
    });
    match result {
        Ok(()) => log::debug!("collinfo cache written"),
        Err(e) => log::debug!("problem writing collinfo cache: {:?}", e),
    }
}

/// Fetch the mirror's collinfo.json (cached locally for a day) and return
/// the cdx-api endpoint URLs, oldest first.
pub async fn get_cc_endpoints(cc_mirror: &str) -> Result<Vec<String>, Error> {
    let body = match check_collinfo_cache(cc_mirror) {
        Some(body) => body,
        None => {
            let url = format!("{}/collinfo.json", cc_mirror.trim_end_matches('/'));
            let resp = myrequests::get(&url, &[], None, GetOpts::default()).await?;
            let text = resp.text();
            set_collinfo_cache(cc_mirror, &text);
            text
        }
    };

    let col: Vec<CollInfo> = serde_json::from_str(&body)?;
    let mut endpoints: Vec<String> = col.into_iter().map(|c| c.cdx_api).collect();
    if endpoints.len() < 60 {
        // last seen to be 100; fewer means the collinfo schema changed
        return Err(Error::SuspiciousCollinfo(endpoints.len()));
    }
    log::info!(
        "Found {} endpoints in the Common Crawl index",
        endpoints.len()
    );

    // endpoints arrive descending, make them ascending
    endpoints.sort();
    Ok(endpoints)
}

/// Fill in the `from`/`to` window Common Crawl queries need. User-supplied
/// values are never widened; `crawl` means the user picked explicit crawls
/// and no defaulting happens at all.
pub fn apply_cc_defaults(
    params: &mut CdxParams,
    crawl_present: bool,
    now: Option<i64>,
) -> Result<(), Error> {
    if let Some(closest) = params.closest.clone() {
        let closest_t = timestamp_to_time(&closest)?;
        if params.from_ts.is_none() {
            params.from_ts = Some(time_to_timestamp(closest_t - THREE_MONTHS));
            log::info!(
                "no from but closest, setting from={}",
                params.from_ts.as_deref().unwrap_or_default()
            );
        }
        if params.to.is_none() {
            params.to = Some(time_to_timestamp(closest_t + THREE_MONTHS));
            log::info!(
                "no to but closest, setting to={}",
                params.to.as_deref().unwrap_or_default()
            );
        }
    } else if !crawl_present {
        if params.from_ts.is_some() {
            if params.to.is_none() {
                log::info!("from but no to, not doing anything");
            }
        } else if let Some(to) = params.to.clone() {
            let to_t = timestamp_to_time(&pad_timestamp_up(&to)?)?;
            params.from_ts = Some(time_to_timestamp(to_t - ONE_YEAR));
            log::info!(
                "to but no from_ts, setting from_ts={}",
                params.from_ts.as_deref().unwrap_or_default()
            );
        } else {
            let now = now.unwrap_or_else(settings::now);
            params.from_ts = Some(time_to_timestamp(now - ONE_YEAR));
            log::info!(
                "no from or to, setting default 1 year ago from_ts={}",
                params.from_ts.as_deref().unwrap_or_default()
            );
        }
    } else {
        // crawl -- assume the user picked the right things
    }
    Ok(())
}

/// Match crawls requested on the command line to actual crawls. `from`/`to`
/// are not considered here.
pub fn match_cc_crawls(crawls: &[String], raw_index_list: &[String]) -> Result<Vec<String>, Error> {
    if crawls.len() == 1 && crawls[0].chars().all(|c| c.is_ascii_digit()) {
        let num: usize = crawls[0]
            .parse()
            .map_err(|_| Error::Internal("integer crawl failed to parse"))?;
        let start = raw_index_list.len().saturating_sub(num);
        let selected = raw_index_list[start..].to_vec();
        log::info!("matched crawls are: {}", selected.iter().join(","));
        return Ok(selected);
    }

    let mut selected = Vec::new();
    let mut used = Vec::new();
    for asked in crawls {
        for available in raw_index_list {
            if available.contains(asked.as_str()) {
                if !used.contains(asked) {
                    used.push(asked.clone());
                }
                if !selected.contains(available) {
                    selected.push(available.clone());
                }
            }
        }
    }
    if used.is_empty() {
        return Err(Error::CrawlMismatch(crawls.iter().join(",")));
    }
    let missed: Vec<&String> = crawls.iter().filter(|c| !used.contains(c)).collect();
    if !missed.is_empty() {
        log::warn!(
            "No matches for these crawl args: {}",
            missed.iter().join(",")
        );
    }
    selected.sort();
    log::info!("matched crawls are: {}", selected.iter().join(","));
    Ok(selected)
}

/// Chainsaw all of the cc index names to a time, which we use as the
/// end-time of that index's data.
pub fn make_cc_maps(raw_index_list: &[String]) -> (BTreeMap<i64, String>, Vec<i64>) {
    lazy_static! {
        static ref WEEKLY: Regex = Regex::new(r"CC-MAIN-(\d\d\d\d-\d\d)-").unwrap();
        static ref SPECIAL: Regex = Regex::new(r"CC-MAIN-(\d\d\d\d-\d\d\d\d)-").unwrap();
        static ref SPECIAL_YEAR: Regex = Regex::new(r"CC-MAIN-(\d\d\d\d)-i").unwrap();
    }

    let mut cc_map = BTreeMap::new();
    for endpoint in raw_index_list {
        let mut t = None;
        if let Some(m) = WEEKLY.captures(endpoint) {
            t = cc_index_to_time(&m[1]).ok();
        }
        if let Some(m) = SPECIAL.captures(endpoint) {
            t = cc_index_to_time_special(&m[1]);
        }
        if let Some(m) = SPECIAL_YEAR.captures(endpoint) {
            t = cc_index_to_time_special(&m[1]);
        }
        match t {
            Some(t) => {
                cc_map.insert(t, endpoint.clone());
            }
            None => log::error!("unable to parse date out of {}", endpoint),
        }
    }
    let cc_times = cc_map.keys().copied().collect();
    (cc_map, cc_times)
}

/// Resolve the caller's time specification to epoch bounds. By the time
/// this runs, `apply_cc_defaults` guarantees `from` exists.
pub fn check_cc_from_to(params: &CdxParams) -> Result<(i64, Option<i64>), Error> {
    let from_ts = params
        .from_ts
        .as_deref()
        .ok_or(Error::Internal("from_ts missing after defaulting"))?;
    let from_t = timestamp_to_time(from_ts)?;

    let to_t = if params.closest.is_some() {
        let to = params
            .to
            .as_deref()
            .ok_or(Error::Internal("to missing with closest"))?;
        Some(timestamp_to_time(to)?)
    } else {
        match params.to.as_deref() {
            Some(to) => Some(timestamp_to_time(&pad_timestamp_up(to)?)?),
            None => None,
        }
    };
    Ok((from_t, to_t))
}

/// Bisect the time-sorted endpoint list down to the indexes that can hold
/// captures in `[from_t, to_t]`. The endpoint covering `from` is the one
/// preceding it by name, hence the back-off by one.
pub fn bisect_cc(
    cc_map: &BTreeMap<i64, String>,
    cc_times: &[i64],
    from_t: i64,
    to_t: Option<i64>,
) -> Vec<String> {
    let start = cc_times.partition_point(|&t| t < from_t).saturating_sub(1);
    let end = match to_t {
        Some(to_t) => (cc_times.partition_point(|&t| t <= to_t) + 1).min(cc_times.len()),
        None => cc_times.len(),
    };
    if start >= end {
        return Vec::new();
    }
    cc_times[start..end]
        .iter()
        .map(|t| cc_map[t].clone())
        .collect()
}

/// Narrow the raw endpoint list for one query: explicit crawls win, else
/// time bisection; then apply the configured ordering. The canonical
/// `from`/`to` window is written back into `params` so every endpoint sees
/// the same query.
pub fn filter_cc_endpoints(
    raw_index_list: &[String],
    cc_sort: CcSort,
    params: &mut CdxParams,
    crawl: Option<&[String]>,
) -> Result<Vec<String>, Error> {
    let crawl_present = crawl.is_some();
    let mut index_list = match crawl {
        Some(crawls) => match_cc_crawls(crawls, raw_index_list)?,
        None => {
            let (cc_map, cc_times) = make_cc_maps(raw_index_list);
            let (from_t, to_t) = check_cc_from_to(params)?;
            let index_list = bisect_cc(&cc_map, &cc_times, from_t, to_t);

            params.from_ts = Some(time_to_timestamp(from_t));
            if let Some(to_t) = to_t {
                params.to = Some(time_to_timestamp(to_t));
            }
            index_list
        }
    };

    match cc_sort {
        CcSort::Ascending => {}
        CcSort::Mixed => index_list.reverse(),
    }

    if index_list.is_empty() {
        log::warn!("empty cc index range found");
    } else if crawl_present {
        log::info!("using cc crawls {}", index_list.iter().join(","));
    } else {
        log::info!(
            "using cc index range from {} to {}",
            index_list[0],
            index_list[index_list.len() - 1]
        );
    }

    Ok(index_list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(from_ts: Option<&str>, to: Option<&str>, closest: Option<&str>) -> CdxParams {
        CdxParams {
            from_ts: from_ts.map(str::to_string),
            to: to.map(str::to_string),
            closest: closest.map(str::to_string),
            ..CdxParams::default()
        }
    }

    #[test]
    fn cc_defaults() {
        let now = 1524962339; // 20180429003859

        // (input, expected from_ts, expected to)
        let tests = [
            (
                params(None, None, Some("20180101")),
                Some("20171003000000"),
                Some("20180401000000"),
            ),
            (
                params(None, Some("20181201"), Some("20180101")),
                Some("20171003000000"),
                Some("20181201"),
            ),
            (
                params(None, Some("20180101"), None),
                Some("20170101235959"),
                Some("20180101"),
            ),
            (params(None, None, None), Some("20170429003859"), None),
            (
                params(Some("20100101"), None, Some("20150301")),
                Some("20100101"),
                Some("20150530000000"),
            ),
            (params(Some("20100101"), None, None), Some("20100101"), None),
        ];

        for (mut p, from_ts, to) in tests {
            apply_cc_defaults(&mut p, false, Some(now)).unwrap();
            assert_eq!(p.from_ts.as_deref(), from_ts);
            assert_eq!(p.to.as_deref(), to);
        }
    }

    #[test]
    fn crawl_defaults_do_nothing() {
        let mut p = params(None, None, None);
        apply_cc_defaults(&mut p, true, Some(1524962339)).unwrap();
        assert!(p.from_ts.is_none());
        assert!(p.to.is_none());
    }

    fn my_cc_endpoints() -> Vec<String> {
        [
            "http://index.commoncrawl.org/CC-MAIN-2013-20-index",
            "http://index.commoncrawl.org/CC-MAIN-2017-51-index",
            "http://index.commoncrawl.org/CC-MAIN-2018-05-index",
            "http://index.commoncrawl.org/CC-MAIN-2018-09-index",
            "http://index.commoncrawl.org/CC-MAIN-2018-13-index",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn select(
        from_ts: Option<&str>,
        to: Option<&str>,
        closest: Option<&str>,
        sort: CcSort,
    ) -> Vec<String> {
        let endpoints = my_cc_endpoints();
        let mut p = params(from_ts, to, closest);
        apply_cc_defaults(&mut p, false, Some(1524962339)).unwrap();
        filter_cc_endpoints(&endpoints, sort, &mut p, None).unwrap()
    }

    #[test]
    fn endpoint_bisection() {
        let e = my_cc_endpoints();
        let rev = |v: &[String]| v.iter().rev().cloned().collect::<Vec<_>>();

        // gets the whole list because 201704 is before the first 2017 index
        assert_eq!(select(None, Some("201804"), None, CcSort::Mixed), rev(&e));
        assert_eq!(
            select(Some("201801"), Some("201804"), None, CcSort::Mixed),
            rev(&e[1..5])
        );
        assert_eq!(
            select(Some("20180214"), Some("201804"), None, CcSort::Mixed),
            rev(&e[2..5])
        );
        assert_eq!(
            select(Some("20180429"), Some("20180430"), None, CcSort::Mixed),
            e[4..5].to_vec()
        );
        // empty time range still returns the covering endpoint
        assert_eq!(
            select(Some("20180430"), Some("20180429"), None, CcSort::Mixed),
            e[4..5].to_vec()
        );
        // very empty time range
        assert!(select(Some("20180430"), Some("20100429"), None, CcSort::Mixed).is_empty());

        // ascending is the unreversed slice
        assert_eq!(
            select(Some("201801"), Some("201804"), None, CcSort::Ascending),
            e[1..5].to_vec()
        );
    }

    #[test]
    fn endpoint_bisection_closest() {
        let e = my_cc_endpoints();
        let rev = |v: &[String]| v.iter().rev().cloned().collect::<Vec<_>>();

        assert_eq!(
            select(Some("20171230"), None, Some("201801"), CcSort::Mixed),
            rev(&e)[0..4].to_vec()
        );
        assert_eq!(
            select(Some("20180214"), None, Some("201803"), CcSort::Mixed),
            rev(&e)[0..3].to_vec()
        );
        assert_eq!(
            select(Some("20171230"), Some("201802"), Some("201801"), CcSort::Mixed),
            rev(&e)[2..4].to_vec()
        );
    }

    #[test]
    fn crawl_normalization() {
        assert_eq!(
            normalize_crawl(&["a,b".to_string(), "c".to_string()]).unwrap(),
            vec!["a", "b", "c"]
        );
        assert!(normalize_crawl(&["3,CC-MAIN-2018-05".to_string()]).is_err());
        assert_eq!(normalize_crawl(&["3".to_string()]).unwrap(), vec!["3"]);
    }

    #[test]
    fn crawl_matching() {
        let e = my_cc_endpoints();
        // last N
        assert_eq!(
            match_cc_crawls(&["2".to_string()], &e).unwrap(),
            e[3..5].to_vec()
        );
        // substring
        assert_eq!(
            match_cc_crawls(&["2018-09".to_string()], &e).unwrap(),
            e[3..4].to_vec()
        );
        // one hit, one miss is a warning, not an error
        assert_eq!(
            match_cc_crawls(&["2018-09".to_string(), "1999-01".to_string()], &e).unwrap(),
            e[3..4].to_vec()
        );
        // zero hits is an error
        assert!(match_cc_crawls(&["1999-01".to_string()], &e).is_err());
    }
}
