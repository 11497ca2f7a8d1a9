use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use thiserror::Error;
use tracing::{info, warn};

/// Positional layout of the export. Field `i` of every data row maps to `EXPECTED_COLUMNS[i]`.
pub const EXPECTED_COLUMNS: [&str; 15] = [
    "order_id",
    "product_id",
    "customer_id",
    "product_name",
    "category",
    "region",
    "date_of_sale",
    "quantity",
    "unit_price",
    "discount",
    "shipping_cost",
    "payment_method",
    "customer_name",
    "customer_email",
    "customer_address",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open sales source {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read sales source header: {0}")]
    MalformedHeader(String),
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },
    #[error("failed to read sales record: {0}")]
    Read(#[from] csv::Error),
}

impl SourceError {
    /// Malformed rows are skipped; everything else aborts the refresh.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::MalformedRecord { .. })
    }
}

/// One data row, still as raw text. `line` is the 1-based line in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSalesRecord {
    pub line: u64,
    pub order_id: String,
    pub product_id: String,
    pub customer_id: String,
    pub product_name: String,
    pub category: String,
    pub region: String,
    pub date_of_sale: String,
    pub quantity: String,
    pub unit_price: String,
    pub discount: String,
    pub shipping_cost: String,
    pub payment_method: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_address: String,
}

impl RawSalesRecord {
    fn from_csv(line: u64, record: &StringRecord) -> Result<Self, SourceError> {
        if record.len() < EXPECTED_COLUMNS.len() {
            return Err(SourceError::MalformedRecord {
                line,
                reason: format!(
                    "expected {} fields, found {}",
                    EXPECTED_COLUMNS.len(),
                    record.len()
                ),
            });
        }
        let field = |idx: usize| record.get(idx).unwrap_or_default().to_string();
        Ok(Self {
            line,
            order_id: field(0),
            product_id: field(1),
            customer_id: field(2),
            product_name: field(3),
            category: field(4),
            region: field(5),
            date_of_sale: field(6),
            quantity: field(7),
            unit_price: field(8),
            discount: field(9),
            shipping_cost: field(10),
            payment_method: field(11),
            customer_name: field(12),
            customer_email: field(13),
            customer_address: field(14),
        })
    }
}

/// Opened source with a validated header. Consumed by [`SalesCsvReader::records`];
/// a new run reopens the file from the start.
pub struct SalesCsvReader<R: io::Read> {
    reader: csv::Reader<R>,
    header: Vec<String>,
}

impl SalesCsvReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "opened sales source");
        Self::from_reader(BufReader::with_capacity(1 << 20, file))
    }
}

impl<R: io::Read> SalesCsvReader<R> {
    pub fn from_reader(reader: R) -> Result<Self, SourceError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(reader);

        let header = reader
            .headers()
            .map_err(|err| SourceError::MalformedHeader(err.to_string()))?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if header.len() < EXPECTED_COLUMNS.len() {
            return Err(SourceError::MalformedHeader(format!(
                "expected {} columns, found {}",
                EXPECTED_COLUMNS.len(),
                header.len()
            )));
        }

        for (idx, (found, expected)) in header.iter().zip(EXPECTED_COLUMNS).enumerate() {
            if !found.trim().eq_ignore_ascii_case(expected) {
                warn!(
                    column = idx,
                    expected,
                    found = %found,
                    "header name differs from expected layout; mapping positionally"
                );
            }
        }

        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn records(self) -> SalesRecords<R> {
        SalesRecords {
            inner: self.reader.into_records(),
        }
    }
}

/// Lazy, finite sequence of data rows.
pub struct SalesRecords<R: io::Read> {
    inner: StringRecordsIntoIter<R>,
}

impl<R: io::Read> Iterator for SalesRecords<R> {
    type Item = Result<RawSalesRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next()?;
        Some(match next {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                RawSalesRecord::from_csv(line, &record)
            }
            Err(err) if err.is_io_error() => Err(SourceError::Read(err)),
            Err(err) => Err(SourceError::MalformedRecord {
                line: err.position().map(|p| p.line()).unwrap_or_default(),
                reason: err.to_string(),
            }),
        })
    }
}
