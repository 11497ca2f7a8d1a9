//! Streaming parser for the flat sales export plus the per-run entity resolver.

mod resolve;
mod source;

pub use resolve::{
    parse_decimal, parse_discount, parse_money, parse_quantity, parse_sale_date, EntityResolver,
    ResolvedRecord,
};
pub use source::{RawSalesRecord, SalesCsvReader, SalesRecords, SourceError, EXPECTED_COLUMNS};

pub const CRATE_NAME: &str = "sales-ingest";
