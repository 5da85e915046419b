use cdxt_rs::commoncrawl::{normalize_crawl, CcSort};
use cdxt_rs::filter_cdx::{
    build_matcher, filter_cdx, load_filter_file, resolve_paths, validate_resolved_paths,
    MatchingApproach,
};
use cdxt_rs::filter_warc::get_cdx_paths;
use cdxt_rs::warc::WarcWriter;
use cdxt_rs::{CDXFetcher, CaptureObject, CdxParams, FetcherConfig, WarcFilter, WarcFilterConfig};
use clap::Parser;
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("must specify --cc, --ia, or a --source")]
    NoSource,
    #[error("sorry, the combination of csv and all-fields is not yet implemented")]
    CsvAllFields,
    #[error("logging initialization error")]
    LogInit(#[from] log::SetLoggerError),
    #[error(transparent)]
    Cdx(#[from] cdxt_rs::cdx::Error),
    #[error(transparent)]
    CommonCrawl(#[from] cdxt_rs::commoncrawl::Error),
    #[error(transparent)]
    Capture(#[from] cdxt_rs::capture::Error),
    #[error(transparent)]
    Warc(#[from] cdxt_rs::warc::writer::Error),
    #[error(transparent)]
    FilterCdx(#[from] cdxt_rs::filter_cdx::Error),
    #[error(transparent)]
    FilterWarc(#[from] cdxt_rs::filter_warc::Error),
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
    #[error("csv output error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Parser)]
#[clap(name = "cdxt", version, about = "web archive CDX index and WARC toolkit")]
struct Opts {
    /// Set logging level to INFO (-v) or DEBUG (-vv)
    #[clap(short, long, parse(from_occurrences), global = true)]
    verbose: i32,
    /// Direct the query to the Common Crawl CDX/WARCs
    #[clap(long, global = true)]
    cc: bool,
    /// Direct the query to the Internet Archive CDX/wayback
    #[clap(long, global = true)]
    ia: bool,
    /// Direct the query to this CDX server
    #[clap(long, global = true)]
    source: Option<String>,
    /// Common Crawl crawls to process: names, substrings, or a single
    /// integer meaning the last N crawls (implies --cc)
    #[clap(long, global = true, multiple_occurrences(true))]
    crawl: Vec<String>,
    /// Use this Common Crawl index mirror
    #[clap(long, global = true)]
    cc_mirror: Option<String>,
    /// Default mixed, alternatively: ascending
    #[clap(long, global = true, default_value = "mixed")]
    cc_sort: String,
    /// Direct replays for content to this wayback
    #[clap(long, global = true)]
    wb: Option<String>,
    #[clap(long, global = true)]
    limit: Option<i64>,
    #[clap(long = "from", global = true)]
    from_ts: Option<String>,
    #[clap(long, global = true)]
    to: Option<String>,
    /// Get the closest capture to this timestamp; use with --get
    #[clap(long, global = true)]
    closest: Option<String>,
    /// See CDX API documentation for usage; repeatable
    #[clap(long, global = true, multiple_occurrences(true))]
    filter: Vec<String>,
    /// Use a single get instead of a paged iteration; default limit=1000
    #[clap(long, global = true)]
    get: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Iterate, printing captures
    Iter {
        #[clap(long)]
        all_fields: bool,
        /// Try --all-fields if you need the complete list
        #[clap(long, default_value = "url,status,timestamp")]
        fields: String,
        #[clap(long)]
        jsonl: bool,
        #[clap(long)]
        csv: bool,
        url: String,
    },
    /// Iterate over capture content, creating a warc
    Warc {
        /// Prefix for the warc filename
        #[clap(long, default_value = "TEST")]
        prefix: String,
        /// Subprefix for the warc filename
        #[clap(long)]
        subprefix: Option<String>,
        /// Target for the warc filesize in bytes
        #[clap(long, default_value_t = 1_000_000_000)]
        size: u64,
        /// Creator of the warc: person, organization, service
        #[clap(long)]
        creator: Option<String>,
        /// A person, if the creator is an organization
        #[clap(long)]
        operator: Option<String>,
        /// This pattern must be present to warc an url
        #[clap(long)]
        url_fgrep: Option<String>,
        /// This pattern must not be present to warc an url, e.g. /robots.txt
        #[clap(long)]
        url_fgrepv: Option<String>,
        /// Prefix for downloading content; automatically set for CC
        #[clap(long)]
        warc_download_prefix: Option<String>,
        url: String,
    },
    /// Extract warc records addressed by one or more CDX index files
    #[clap(name = "warc_by_cdx")]
    WarcByCdx {
        /// Path to a CDX index file (local, http(s), or s3)
        #[clap(long)]
        cdx_path: String,
        /// Glob pattern for reading multiple CDX indexes
        #[clap(long)]
        cdx_glob: Option<String>,
        #[clap(long, default_value = "TEST")]
        prefix: String,
        #[clap(long)]
        subprefix: Option<String>,
        /// Target for the warc filesize in bytes
        #[clap(long, default_value_t = 1_000_000_000)]
        size: u64,
        #[clap(long)]
        creator: Option<String>,
        #[clap(long)]
        operator: Option<String>,
        /// The `description` field of the warcinfo record (auto-generated if not set)
        #[clap(long)]
        description: Option<String>,
        /// The `isPartOf` field of the warcinfo record (auto-generated if not set)
        #[clap(long)]
        is_part_of: Option<String>,
        #[clap(long)]
        warc_download_prefix: Option<String>,
        /// Files written to every output shard as WARC resource records
        #[clap(long, multiple_values(true))]
        write_paths_as_resource_records: Vec<String>,
        /// JSON metadata sidecars pairing up with the resource record paths
        #[clap(long, multiple_values(true))]
        write_paths_as_resource_records_metadata: Vec<String>,
        /// Parallel workers for reading and writing WARC records
        #[clap(long, default_value_t = 1)]
        parallel: usize,
        /// Parallel readers (default: same as --parallel)
        #[clap(long)]
        parallel_readers: Option<usize>,
        /// Parallel writers (default: readers / 6, at least 1)
        #[clap(long)]
        parallel_writers: Option<usize>,
        /// Emit a log line every N records (0 = no record logs)
        #[clap(long, default_value_t = 1000)]
        log_every_n: u64,
    },
    /// Filter CDX files against a URL or SURT prefix whitelist
    #[clap(name = "filter_cdx")]
    FilterCdx {
        input_base_path: String,
        /// File of whitelist entries, one per line
        filter_file: String,
        /// Output base; the input directory structure is replicated here
        output_base_path: String,
        /// Whitelist entry format: url or surt
        #[clap(long, default_value = "surt")]
        filter_type: String,
        /// Glob pattern relative to input_base_path, e.g. '/**/*.cdx.gz'
        #[clap(long)]
        input_glob: Option<String>,
        /// Matching approach: trie or tuple (identical semantics)
        #[clap(long, default_value = "tuple")]
        matching_approach: String,
        #[clap(long, default_value_t = 1)]
        parallel: usize,
        /// Allow overwriting existing output files
        #[clap(long)]
        overwrite: bool,
    },
    /// Imprecise count of how many results are available
    Size {
        /// Show details of each subindex
        #[clap(long)]
        details: bool,
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let opts: Opts = Opts::parse();
    let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
    let _ = cdxt_rs::util::init_logging(opts.verbose);

    if let Err(e) = run(opts, &cmdline).await {
        log::error!("{}", e);
        eprintln!("cdxt: {}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts, cmdline: &str) -> Result<(), Error> {
    match &opts.command {
        Command::Iter {
            all_fields,
            fields,
            jsonl,
            csv,
            url,
        } => iterator(&opts, *all_fields, fields, *jsonl, *csv, url).await,
        Command::Warc {
            prefix,
            subprefix,
            size,
            creator,
            operator,
            url_fgrep,
            url_fgrepv,
            warc_download_prefix,
            url,
        } => {
            warcer(
                &opts,
                cmdline,
                prefix,
                subprefix.as_deref(),
                *size,
                creator.as_deref(),
                operator.as_deref(),
                url_fgrep.as_deref(),
                url_fgrepv.as_deref(),
                warc_download_prefix.clone(),
                url,
            )
            .await
        }
        Command::WarcByCdx { .. } => warcer_by_cdx(&opts, cmdline).await,
        Command::FilterCdx {
            input_base_path,
            filter_file,
            output_base_path,
            filter_type,
            input_glob,
            matching_approach,
            parallel,
            overwrite,
        } => filter_cdx_command(
            input_base_path,
            filter_file,
            output_base_path,
            filter_type,
            input_glob.as_deref(),
            matching_approach,
            *parallel,
            *overwrite,
            opts.limit.unwrap_or(0).max(0) as u64,
        ),
        Command::Size { details, url } => sizer(&opts, *details, url).await,
    }
}

/// Build the fetcher and the query params shared by iter/warc/size.
async fn setup(
    opts: &Opts,
    warc_download_prefix: Option<String>,
) -> Result<(CDXFetcher, CdxParams), Error> {
    let crawl = if opts.crawl.is_empty() {
        None
    } else {
        Some(normalize_crawl(&opts.crawl)?)
    };

    let source = if crawl.is_some() || opts.cc {
        "cc".to_string()
    } else if opts.ia {
        "ia".to_string()
    } else if let Some(source) = &opts.source {
        source.clone()
    } else {
        return Err(Error::NoSource);
    };

    let config = FetcherConfig {
        source,
        wb: opts.wb.clone(),
        cc_mirror: opts.cc_mirror.clone(),
        cc_sort: opts.cc_sort.parse::<CcSort>()?,
        crawl,
        warc_download_prefix,
    };
    let fetcher = CDXFetcher::new(config).await?;

    let params = CdxParams {
        limit: opts.limit,
        from_ts: opts.from_ts.clone(),
        to: opts.to.clone(),
        closest: opts.closest.clone(),
        filter: opts.filter.clone(),
        ..CdxParams::default()
    };
    if opts.closest.is_some() && !opts.get {
        log::info!("note: --closest works best with --get");
    }

    Ok((fetcher, params))
}

fn split_fields(fields: &str) -> Vec<String> {
    let mut ret = Vec::new();
    for f in fields.split(',') {
        if !ret.iter().any(|x| x == f) {
            ret.push(f.to_string());
        }
    }
    ret
}

fn winnow_fields<'a>(
    all_fields: bool,
    fields: &[String],
    obj: &'a CaptureObject,
) -> BTreeMap<&'a str, &'a str> {
    let map = obj.capture.fields();
    if all_fields {
        map
    } else {
        fields
            .iter()
            .filter_map(|f| map.get_key_value(f.as_str()).map(|(k, v)| (*k, *v)))
            .collect()
    }
}

fn print_line(
    jsonl: bool,
    csv_writer: Option<&mut csv::Writer<std::io::Stdout>>,
    fields: &[String],
    printme: &BTreeMap<&str, &str>,
) -> Result<(), Error> {
    if jsonl {
        println!("{}", serde_json::to_string(printme).unwrap_or_default());
    } else if let Some(writer) = csv_writer {
        let row: Vec<&str> = fields
            .iter()
            .map(|f| printme.get(f.as_str()).copied().unwrap_or(""))
            .collect();
        writer.write_record(row)?;
        writer.flush()?;
    } else {
        let joined = printme
            .iter()
            .map(|(k, v)| format!("{} {}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        println!("{}", joined);
    }
    Ok(())
}

async fn iterator(
    opts: &Opts,
    all_fields: bool,
    fields: &str,
    jsonl: bool,
    csv: bool,
    url: &str,
) -> Result<(), Error> {
    let (cdx, params) = setup(opts, None).await?;
    let fields = split_fields(fields);

    if csv && all_fields {
        return Err(Error::CsvAllFields);
    }
    let mut csv_writer = if csv {
        let mut writer = csv::Writer::from_writer(std::io::stdout());
        writer.write_record(&fields)?;
        Some(writer)
    } else {
        None
    };

    if opts.get {
        for obj in cdx.get(url, &params).await? {
            let printme = winnow_fields(all_fields, &fields, &obj);
            print_line(jsonl, csv_writer.as_mut(), &fields, &printme)?;
        }
        return Ok(());
    }

    let stream = cdx.iter(url, &params)?;
    futures::pin_mut!(stream);
    while let Some(obj) = stream.try_next().await? {
        let printme = winnow_fields(all_fields, &fields, &obj);
        print_line(jsonl, csv_writer.as_mut(), &fields, &printme)?;
    }
    Ok(())
}

fn warcinfo_fields(
    cmdline: &str,
    prefix: &str,
    subprefix: Option<&str>,
    creator: Option<&str>,
    operator: Option<&str>,
    description: Option<&str>,
    is_part_of: Option<&str>,
) -> Vec<(String, String)> {
    let ispartof = match is_part_of {
        Some(value) => value.to_string(),
        None => match subprefix {
            Some(sub) => format!("{}-{}", prefix, sub),
            None => prefix.to_string(),
        },
    };
    let description = match description {
        Some(value) => value.to_string(),
        None => format!("warc extraction generated with: {}", cmdline),
    };

    let mut info = vec![
        (
            "software".to_string(),
            concat!("cdxt-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        ),
        ("isPartOf".to_string(), ispartof),
        ("description".to_string(), description),
        ("format".to_string(), "WARC file version 1.0".to_string()),
    ];
    if let Some(creator) = creator {
        info.push(("creator".to_string(), creator.to_string()));
    }
    if let Some(operator) = operator {
        info.push(("operator".to_string(), operator.to_string()));
    }
    info
}

#[allow(clippy::too_many_arguments)]
async fn warcer(
    opts: &Opts,
    cmdline: &str,
    prefix: &str,
    subprefix: Option<&str>,
    size: u64,
    creator: Option<&str>,
    operator: Option<&str>,
    url_fgrep: Option<&str>,
    url_fgrepv: Option<&str>,
    warc_download_prefix: Option<String>,
    url: &str,
) -> Result<(), Error> {
    let (cdx, params) = setup(opts, warc_download_prefix).await?;

    let info = warcinfo_fields(cmdline, prefix, subprefix, creator, operator, None, None);
    let mut writer = WarcWriter::new(prefix, subprefix, info, Some(size), true);

    let stream = cdx.iter(url, &params)?;
    futures::pin_mut!(stream);
    while let Some(mut obj) = stream.try_next().await? {
        let capture_url = obj.get("url").unwrap_or_default().to_string();
        let timestamp = obj.get("timestamp").unwrap_or_default().to_string();

        if let Some(pattern) = url_fgrep {
            if !capture_url.contains(pattern) {
                log::debug!("not warcing due to fgrep: {}", capture_url);
                continue;
            }
        }
        if let Some(pattern) = url_fgrepv {
            if capture_url.contains(pattern) {
                log::debug!("not warcing due to fgrepv: {}", capture_url);
                continue;
            }
        }

        if obj.is_revisit() {
            log::warn!(
                "revisit record being resolved for url {} {}",
                capture_url,
                timestamp
            );
        }
        match obj.fetch_warc_record().await {
            Ok(record) => writer.write_record(record)?,
            Err(e) if record_fetch_is_skippable(&e) => {
                log::warn!("skipping capture for 404: {} {}", capture_url, timestamp);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A missing record (404 at the byte range or the wayback) is logged and
/// skipped; everything else aborts the run.
fn record_fetch_is_skippable(e: &cdxt_rs::capture::Error) -> bool {
    use cdxt_rs::capture::Error as CaptureError;
    use cdxt_rs::myrequests::Error as HttpError;
    use cdxt_rs::warc::fetch::Error as FetchError;

    matches!(
        e,
        CaptureError::Http(HttpError::BadUrl { .. })
            | CaptureError::Fetch(FetchError::Http(HttpError::BadUrl { .. }))
            | CaptureError::Fetch(FetchError::InvalidRecord)
    )
}

async fn warcer_by_cdx(opts: &Opts, cmdline: &str) -> Result<(), Error> {
    let Command::WarcByCdx {
        cdx_path,
        cdx_glob,
        prefix,
        subprefix,
        size,
        creator,
        operator,
        description,
        is_part_of,
        warc_download_prefix,
        write_paths_as_resource_records,
        write_paths_as_resource_records_metadata,
        parallel,
        parallel_readers,
        parallel_writers,
        log_every_n,
    } = &opts.command
    else {
        unreachable!("warcer_by_cdx called for a different subcommand");
    };

    let cdx_paths = get_cdx_paths(cdx_path, cdx_glob.as_deref())?;
    let gzip = cdx_paths
        .first()
        .map(|p| p.ends_with(".gz"))
        .unwrap_or(false);

    if let Some(parent) = Path::new(prefix).parent() {
        if !parent.as_os_str().is_empty() && !cdxt_rs::s3::is_s3_url(prefix) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let info = warcinfo_fields(
        cmdline,
        prefix,
        subprefix.as_deref(),
        creator.as_deref(),
        operator.as_deref(),
        description.as_deref(),
        is_part_of.as_deref(),
    );

    let config = WarcFilterConfig {
        cdx_paths,
        prefix_path: prefix.clone(),
        writer_info: info,
        writer_subprefix: subprefix.clone(),
        write_paths_as_resource_records: write_paths_as_resource_records.clone(),
        write_paths_as_resource_records_metadata: write_paths_as_resource_records_metadata
            .clone(),
        record_limit: opts.limit.unwrap_or(0).max(0) as u64,
        log_every_n: *log_every_n,
        warc_download_prefix: warc_download_prefix.clone(),
        n_parallel: *parallel,
        n_parallel_readers: *parallel_readers,
        n_parallel_writers: *parallel_writers,
        gzip,
        max_file_size: *size,
        ..WarcFilterConfig::default()
    };

    let filter = WarcFilter::new(config)?;
    let records_n = filter.filter().await?;
    log::info!("WARC records extracted: {}", records_n);
    println!("{}", records_n);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn filter_cdx_command(
    input_base_path: &str,
    filter_file: &str,
    output_base_path: &str,
    filter_type: &str,
    input_glob: Option<&str>,
    matching_approach: &str,
    parallel: usize,
    overwrite: bool,
    limit: u64,
) -> Result<(), Error> {
    log::info!("Filtering CDX files based on whitelist");

    let (input_paths, output_paths) =
        resolve_paths(input_base_path, input_glob, output_base_path)?;
    validate_resolved_paths(&output_paths, overwrite)?;
    log::info!(
        "Found {} files matching pattern: {}{}",
        input_paths.len(),
        input_base_path,
        input_glob.unwrap_or("")
    );

    let prefixes = load_filter_file(Path::new(filter_file), filter_type == "url")?;
    let approach = if matching_approach == "trie" {
        MatchingApproach::Trie
    } else {
        MatchingApproach::Tuple
    };
    let matcher = build_matcher(approach, &prefixes);

    let (lines_n, included_n, errors_n) = filter_cdx(
        matcher.as_ref(),
        &input_paths,
        &output_paths,
        parallel.max(1),
        limit,
    )?;

    let ratio = if lines_n > 0 {
        included_n as f64 / lines_n as f64
    } else {
        0.0
    };
    log::info!(
        "Filter statistics: {} / {} lines ({:.4})",
        included_n,
        lines_n,
        ratio
    );
    log::info!("Errors: {}", errors_n);
    Ok(())
}

async fn sizer(opts: &Opts, details: bool, url: &str) -> Result<(), Error> {
    let (cdx, params) = setup(opts, None).await?;
    let (total, breakdown) = cdx.get_size_estimate(url, &params, false).await?;

    let mut stdout = std::io::stdout();
    if details {
        for (endpoint, pages) in &breakdown {
            writeln!(stdout, "{} {}", endpoint, pages)?;
        }
    }
    writeln!(stdout, "{}", total)?;
    Ok(())
}
