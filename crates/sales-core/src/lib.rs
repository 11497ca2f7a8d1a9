//! Core domain model for the sales dataset: the four normalized tables and the refresh journal.

use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sales-core";

/// Customer row, keyed by the externally supplied `customer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: String,
    pub name: String,
    pub email: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    pub category: String,
}

/// One row per source record. `shipping_cost` is carried at 2 decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    pub region: String,
    pub date_of_sale: NaiveDate,
    pub payment_method: String,
    pub shipping_cost: BigDecimal,
}

/// Line item; the surrogate id is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: String,
    pub product_id: String,
    pub quantity_sold: i32,
    pub unit_price: BigDecimal,
    pub discount: BigDecimal,
}

/// `NUMERIC(10, 2)`: shipping cost and unit price.
pub const CURRENCY_PRECISION: i64 = 10;
pub const CURRENCY_SCALE: i64 = 2;
/// `NUMERIC(5, 4)`: discount fraction.
pub const DISCOUNT_PRECISION: i64 = 5;
pub const DISCOUNT_SCALE: i64 = 4;

/// Digits left of the decimal point. Zero or negative below one.
pub fn integer_digits(value: &BigDecimal) -> i64 {
    let (_, scale) = value.as_bigint_and_exponent();
    i64::try_from(value.digits())
        .unwrap_or(i64::MAX)
        .saturating_sub(scale)
}

/// Whether `value` fits a `NUMERIC(precision, scale)` column once rounded
/// half-up to `scale`. Never materializes the digits of an oversized exponent.
pub fn fits_numeric(value: &BigDecimal, precision: i64, scale: i64) -> bool {
    if value.is_zero() {
        return true;
    }
    let limit = precision - scale;
    let digits = integer_digits(value);
    if digits > limit {
        return false;
    }
    if digits < -scale {
        return true;
    }
    integer_digits(&value.with_scale_round(scale, RoundingMode::HalfUp)) <= limit
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    InProgress,
    Success,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::InProgress => "in_progress",
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefreshStatus::InProgress)
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown refresh status {0:?}")]
pub struct UnknownRefreshStatus(pub String);

impl FromStr for RefreshStatus {
    type Err = UnknownRefreshStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RefreshStatus::InProgress),
            "success" => Ok(RefreshStatus::Success),
            "failed" => Ok(RefreshStatus::Failed),
            other => Err(UnknownRefreshStatus(other.to_string())),
        }
    }
}

/// Journal entry for one refresh attempt. Append-only; finalized exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshLog {
    pub id: i64,
    pub status: RefreshStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub records_count: i64,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRefreshLog {
    pub start_time: DateTime<Utc>,
}

impl NewRefreshLog {
    pub fn started_at(start_time: DateTime<Utc>) -> Self {
        Self { start_time }
    }
}

/// Terminal fields written when a refresh finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshLogUpdate {
    pub status: RefreshStatus,
    pub end_time: DateTime<Utc>,
    pub records_count: i64,
    pub error_message: String,
}

impl RefreshLogUpdate {
    pub fn success(records_count: i64, end_time: DateTime<Utc>) -> Self {
        Self {
            status: RefreshStatus::Success,
            end_time,
            records_count,
            error_message: String::new(),
        }
    }

    pub fn failed(error_message: impl Into<String>, end_time: DateTime<Utc>) -> Self {
        Self {
            status: RefreshStatus::Failed,
            end_time,
            records_count: 0,
            error_message: error_message.into(),
        }
    }
}
