pub mod fetch;
pub mod record;
pub mod writer;

pub use fetch::{fetch_warc_record, fetch_wb_warc};
pub use record::WarcRecord;
pub use writer::WarcWriter;
