use std::collections::HashSet;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use chrono::NaiveDate;
use sales_core::{
    fits_numeric, integer_digits, Customer, Order, OrderItem, Product, CURRENCY_PRECISION,
    CURRENCY_SCALE, DISCOUNT_PRECISION, DISCOUNT_SCALE,
};
use tracing::warn;

use crate::source::RawSalesRecord;

const SALE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Entities derived from one source row. Customer/product are `None` when their
/// key was already emitted earlier in the same run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub customer: Option<Customer>,
    pub product: Option<Product>,
    pub order: Order,
    pub item: OrderItem,
}

/// Run-scoped resolver: first-seen-wins dedup of customers and products.
/// Build a fresh one per refresh; the seen-sets die with it.
#[derive(Debug)]
pub struct EntityResolver {
    processing_date: NaiveDate,
    customers_seen: HashSet<String>,
    products_seen: HashSet<String>,
    field_warnings: u64,
}

impl EntityResolver {
    /// `processing_date` replaces unparseable sale dates.
    pub fn new(processing_date: NaiveDate) -> Self {
        Self {
            processing_date,
            customers_seen: HashSet::new(),
            products_seen: HashSet::new(),
            field_warnings: 0,
        }
    }

    pub fn resolve(&mut self, record: RawSalesRecord) -> ResolvedRecord {
        let line = record.line;

        let quantity_sold = parse_quantity(&record.quantity).unwrap_or_else(|| {
            self.warn_field(line, "quantity", &record.quantity, "0");
            0
        });
        let unit_price = parse_money(&record.unit_price).unwrap_or_else(|| {
            self.warn_field(line, "unit_price", &record.unit_price, "0.00");
            zero(CURRENCY_SCALE)
        });
        let discount = parse_discount(&record.discount).unwrap_or_else(|| {
            self.warn_field(line, "discount", &record.discount, "0");
            zero(DISCOUNT_SCALE)
        });
        let shipping_cost = parse_money(&record.shipping_cost).unwrap_or_else(|| {
            self.warn_field(line, "shipping_cost", &record.shipping_cost, "0.00");
            zero(CURRENCY_SCALE)
        });
        let date_of_sale = parse_sale_date(&record.date_of_sale).unwrap_or_else(|| {
            let fallback = self.processing_date;
            self.warn_field(line, "date_of_sale", &record.date_of_sale, &fallback.to_string());
            fallback
        });

        let customer = self
            .customers_seen
            .insert(record.customer_id.clone())
            .then(|| Customer {
                customer_id: record.customer_id.clone(),
                name: record.customer_name,
                email: record.customer_email,
                address: record.customer_address,
            });

        let product = self
            .products_seen
            .insert(record.product_id.clone())
            .then(|| Product {
                product_id: record.product_id.clone(),
                name: record.product_name,
                category: record.category,
            });

        let order = Order {
            order_id: record.order_id.clone(),
            customer_id: record.customer_id,
            region: record.region,
            date_of_sale,
            payment_method: record.payment_method,
            shipping_cost,
        };

        let item = OrderItem {
            order_id: record.order_id,
            product_id: record.product_id,
            quantity_sold,
            unit_price,
            discount,
        };

        ResolvedRecord {
            customer,
            product,
            order,
            item,
        }
    }

    pub fn distinct_customers(&self) -> usize {
        self.customers_seen.len()
    }

    pub fn distinct_products(&self) -> usize {
        self.products_seen.len()
    }

    /// Number of fields replaced by a default so far.
    pub fn field_warnings(&self) -> u64 {
        self.field_warnings
    }

    fn warn_field(&mut self, line: u64, field: &'static str, raw: &str, substitute: &str) {
        self.field_warnings += 1;
        warn!(line, field, value = %raw, substitute, "malformed field; substituting default");
    }
}

/// Non-negative integer quantity.
pub fn parse_quantity(raw: &str) -> Option<i32> {
    raw.trim().parse::<i32>().ok().filter(|q| *q >= 0)
}

/// Decimal rounded half-up to `scale` places. `None` unless it fits a
/// `NUMERIC(precision, scale)` column.
pub fn parse_decimal(raw: &str, precision: i64, scale: i64) -> Option<BigDecimal> {
    let value = BigDecimal::from_str(raw.trim()).ok()?;
    if !fits_numeric(&value, precision, scale) {
        return None;
    }
    if integer_digits(&value) < -scale {
        return Some(zero(scale));
    }
    Some(value.with_scale_round(scale, RoundingMode::HalfUp))
}

/// Currency amount at two places, at most eight integer digits.
pub fn parse_money(raw: &str) -> Option<BigDecimal> {
    parse_decimal(raw, CURRENCY_PRECISION, CURRENCY_SCALE)
}

/// Fraction in `[0, 1]` at four places.
pub fn parse_discount(raw: &str) -> Option<BigDecimal> {
    parse_decimal(raw, DISCOUNT_PRECISION, DISCOUNT_SCALE)
        .filter(|d| *d >= BigDecimal::from(0_i32) && *d <= BigDecimal::from(1_i32))
}

pub fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), SALE_DATE_FORMAT).ok()
}

fn zero(scale: i64) -> BigDecimal {
    BigDecimal::from(0_i32).with_scale(scale)
}
