pub mod capture;
pub mod cdx;
pub mod commoncrawl;
pub mod compat;
pub mod digest;
pub mod filter_cdx;
pub mod filter_warc;
pub mod myrequests;
pub mod s3;
pub mod settings;
pub mod timeutils;
pub mod util;
pub mod warc;

pub use capture::{Capture, CaptureObject};
pub use cdx::{CDXFetcher, CdxParams, FetcherConfig};
pub use filter_warc::{WarcFilter, WarcFilterConfig};
