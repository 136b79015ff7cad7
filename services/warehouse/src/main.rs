//! Warehouse Service - Builds the sales star schema from a flat extract
//!
//! Responsibilities:
//! - Read the transactional sales extract (CSV or Excel workbook)
//! - Normalize column names and types, derive total sales per line item
//! - Keep shipped rows only, trim/title-case categorical fields
//! - Build customer and product dimensions plus a gap-free date spine
//! - Re-key cleaned rows against the dimensions into the fact table
//! - Replace all warehouse tables in a single transaction, then index facts
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same extract + same build = same surrogate keys and same tables

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use clap::Parser;
use encoding_rs::WINDOWS_1252;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "warehouse", about = "Builds the sales star schema from a raw extract")]
struct Args {
    /// Path to the sales extract (CSV, or an Excel workbook)
    #[arg(long)]
    input: String,

    /// Dry run - transform and report, but write nothing to the warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
        })
    }
}

// =============================================================================
// EXTRACT SCHEMA - resolved once, case-insensitively, before any transform
// =============================================================================

const COL_ORDER_NUMBER: &str = "ORDERNUMBER";
const COL_ORDER_DATE: &str = "ORDERDATE";
const COL_QUANTITY: &str = "QUANTITYORDERED";
const COL_PRICE: &str = "PRICEEACH";
const COL_STATUS: &str = "STATUS";
const COL_CUSTOMER_NAME: &str = "CUSTOMERNAME";
const COL_COUNTRY: &str = "COUNTRY";
const COL_CITY: &str = "CITY";
const COL_PRODUCT_CODE: &str = "PRODUCTCODE";
const COL_PRODUCT_LINE: &str = "PRODUCTLINE";
const COL_DEAL_SIZE: &str = "DEALSIZE";

const REQUIRED_COLUMNS: &[&str] = &[
    COL_ORDER_NUMBER,
    COL_ORDER_DATE,
    COL_QUANTITY,
    COL_PRICE,
    COL_STATUS,
    COL_CUSTOMER_NAME,
    COL_COUNTRY,
    COL_CITY,
    COL_PRODUCT_CODE,
    COL_PRODUCT_LINE,
    COL_DEAL_SIZE,
];

/// The raw extract exactly as read: header names and string cells.
/// Rows may be ragged; absent cells are treated as missing downstream.
#[derive(Debug, Clone)]
struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Column positions for the eleven required extract columns.
///
/// Resolved once against the header row with trimmed, case-insensitive
/// matching. A failed resolution names every missing column so a bad
/// extract fails at ingestion, not deep inside the pipeline.
#[derive(Debug, Clone)]
struct ExtractSchema {
    order_number: usize,
    order_date: usize,
    quantity: usize,
    price: usize,
    status: usize,
    customer_name: usize,
    country: usize,
    city: usize,
    product_code: usize,
    product_line: usize,
    deal_size: usize,
}

impl ExtractSchema {
    fn resolve(headers: &[String]) -> Result<Self> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|name| find(name).is_none())
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "extract schema mismatch: missing required column(s): {}",
                missing.join(", ")
            );
        }

        let col = |name: &str| find(name).unwrap_or_default();
        Ok(Self {
            order_number: col(COL_ORDER_NUMBER),
            order_date: col(COL_ORDER_DATE),
            quantity: col(COL_QUANTITY),
            price: col(COL_PRICE),
            status: col(COL_STATUS),
            customer_name: col(COL_CUSTOMER_NAME),
            country: col(COL_COUNTRY),
            city: col(COL_CITY),
            product_code: col(COL_PRODUCT_CODE),
            product_line: col(COL_PRODUCT_LINE),
            deal_size: col(COL_DEAL_SIZE),
        })
    }
}

// =============================================================================
// EXTRACT READERS - CSV and Excel both feed the same RawTable
// =============================================================================

/// Decode extract bytes: UTF-8 when valid (BOM stripped), Windows-1252
/// otherwise. The upstream export tool writes Latin-1.
fn decode_extract(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix('\u{feff}').unwrap_or(text).to_string(),
        Err(_) => WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

fn read_csv_extract(content: &str) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("malformed CSV record at line {}", line_idx + 2))?;
        rows.push(record.iter().map(|cell| cell.to_string()).collect());
    }

    Ok(RawTable { headers, rows })
}

/// Detect an Excel workbook by file extension
fn is_excel_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".xls")
        || lower.ends_with(".xlsx")
        || lower.ends_with(".xlsb")
        || lower.ends_with(".ods")
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Empty => String::new(),
        other => format!("{}", other),
    }
}

fn read_excel_extract(path: &Path) -> Result<RawTable> {
    // calamine auto-detects format: xls, xlsx, xlsb, ods
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).context("Failed to open Excel workbook")?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names.first().context("workbook has no sheets")?.clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let mut row_iter = range.rows();
    let headers: Vec<String> = row_iter
        .next()
        .context("sheet has no header row")?
        .iter()
        .map(cell_to_string)
        .collect();
    let rows = row_iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok(RawTable { headers, rows })
}

// =============================================================================
// RECORD NORMALIZER - canonical names, typed fields, derived total
// =============================================================================

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M"];

/// One extract row with canonical field names and typed values.
/// A row that failed date parsing carries `None` and is unusable
/// downstream; it never reaches the clean record set.
#[derive(Debug, Clone, PartialEq)]
struct NormalizedRecord {
    order_number: String,
    order_date: Option<NaiveDate>,
    quantity: i64,
    price: f64,
    total: f64,
    status: String,
    customer_name: String,
    country: String,
    city: String,
    product_code: String,
    product_line: String,
    deal_size: String,
}

/// Parse the order date against an explicit, ordered format list.
/// First match wins; no match propagates as `None`, never a default date.
fn parse_order_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(date);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(datetime.date());
        }
    }
    None
}

/// Unparsable or missing quantity coerces to 0; fractional values
/// truncate toward zero; negatives clamp to 0.
fn parse_quantity(value: &str) -> i64 {
    let value = value.trim();
    let parsed = value
        .parse::<i64>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as i64)
        })
        .unwrap_or(0);
    parsed.max(0)
}

/// Unparsable, missing, non-finite or negative price coerces to 0.0.
fn parse_price(value: &str) -> f64 {
    match value.trim().parse::<f64>() {
        Ok(price) if price.is_finite() && price >= 0.0 => price,
        _ => 0.0,
    }
}

/// Pure transform: no per-row errors, coercions only.
fn normalize_records(raw: &RawTable, schema: &ExtractSchema) -> Vec<NormalizedRecord> {
    raw.rows
        .iter()
        .map(|row| {
            let cell = |idx: usize| row.get(idx).map(String::as_str).unwrap_or("");
            let quantity = parse_quantity(cell(schema.quantity));
            let price = parse_price(cell(schema.price));
            NormalizedRecord {
                order_number: cell(schema.order_number).trim().to_string(),
                order_date: parse_order_date(cell(schema.order_date)),
                quantity,
                price,
                // computed after coercion: missing inputs yield 0, not null
                total: quantity as f64 * price,
                status: cell(schema.status).trim().to_string(),
                customer_name: cell(schema.customer_name).to_string(),
                country: cell(schema.country).to_string(),
                city: cell(schema.city).to_string(),
                product_code: cell(schema.product_code).to_string(),
                product_line: cell(schema.product_line).to_string(),
                deal_size: cell(schema.deal_size).to_string(),
            }
        })
        .collect()
}

// =============================================================================
// ROW FILTER & ENRICHER - shipped rows only, clean categoricals
// =============================================================================

const SHIPPED_STATUS: &str = "shipped";
const UNKNOWN: &str = "Unknown";
const NOT_AVAILABLE: &str = "Not Available";

/// A business-valid row: shipped, dated, categoricals cleaned.
#[derive(Debug, Clone, PartialEq)]
struct CleanRecord {
    order_number: String,
    order_date: NaiveDate,
    quantity: i64,
    price: f64,
    total: f64,
    customer_name: String,
    country: String,
    city: String,
    product_code: String,
    product_line: String,
    deal_size: String,
}

/// Title-case every alphabetic run: first letter upper, rest lower.
fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alphabetic = false;
    for ch in value.chars() {
        if ch.is_alphabetic() {
            if prev_alphabetic {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alphabetic = true;
        } else {
            out.push(ch);
            prev_alphabetic = false;
        }
    }
    out
}

fn clean_field(value: &str) -> String {
    title_case(value.trim())
}

fn or_sentinel(value: String, sentinel: &str) -> String {
    if value.is_empty() {
        sentinel.to_string()
    } else {
        value
    }
}

/// Keep shipped rows with a parsed order date; trim and title-case the
/// categorical fields; backfill the sentinel values last.
fn filter_and_enrich(records: Vec<NormalizedRecord>) -> Vec<CleanRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            if !record.status.eq_ignore_ascii_case(SHIPPED_STATUS) {
                return None;
            }
            // a row with no parsable date cannot join the date spine
            let order_date = record.order_date?;
            Some(CleanRecord {
                order_number: record.order_number,
                order_date,
                quantity: record.quantity,
                price: record.price,
                total: record.total,
                customer_name: clean_field(&record.customer_name),
                country: or_sentinel(clean_field(&record.country), UNKNOWN),
                city: or_sentinel(clean_field(&record.city), NOT_AVAILABLE),
                product_code: record.product_code,
                product_line: or_sentinel(clean_field(&record.product_line), UNKNOWN),
                deal_size: or_sentinel(clean_field(&record.deal_size), UNKNOWN),
            })
        })
        .collect()
}

// =============================================================================
// DIMENSION BUILDER - dense 1-based surrogate keys
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct CustomerRow {
    customer_key: i64,
    customer_name: String,
    country: String,
    city: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ProductRow {
    product_key: i64,
    product_code: String,
    product_line: String,
}

#[derive(Debug, Clone, PartialEq)]
struct DateRow {
    date_key: i64,
    order_date: NaiveDate,
    year: i64,
    month: i64,
    day: i64,
    month_name: String,
    quarter: i64,
}

fn build_customer_dim(records: &[CleanRecord]) -> Vec<CustomerRow> {
    let mut seen = HashSet::new();
    let mut rows: Vec<CustomerRow> = Vec::new();
    for record in records {
        let key = (
            record.customer_name.as_str(),
            record.country.as_str(),
            record.city.as_str(),
        );
        if seen.insert(key) {
            rows.push(CustomerRow {
                customer_key: rows.len() as i64 + 1,
                customer_name: record.customer_name.clone(),
                country: record.country.clone(),
                city: record.city.clone(),
            });
        }
    }
    rows
}

fn build_product_dim(records: &[CleanRecord]) -> Vec<ProductRow> {
    let mut seen = HashSet::new();
    let mut rows: Vec<ProductRow> = Vec::new();
    for record in records {
        let key = (record.product_code.as_str(), record.product_line.as_str());
        if seen.insert(key) {
            rows.push(ProductRow {
                product_key: rows.len() as i64 + 1,
                product_code: record.product_code.clone(),
                product_line: record.product_line.clone(),
            });
        }
    }
    rows
}

/// One row per calendar day between the min and max order date,
/// inclusive, chronological, no gaps. Leap days and month/quarter
/// boundaries come from the calendar itself.
fn build_date_dim(records: &[CleanRecord]) -> Result<Vec<DateRow>> {
    let min_date = records
        .iter()
        .map(|r| r.order_date)
        .min()
        .context("no cleaned rows to derive the calendar range from")?;
    let max_date = records
        .iter()
        .map(|r| r.order_date)
        .max()
        .unwrap_or(min_date);

    let mut rows = Vec::new();
    let mut day = min_date;
    while day <= max_date {
        rows.push(DateRow {
            date_key: rows.len() as i64 + 1,
            order_date: day,
            year: i64::from(day.year()),
            month: i64::from(day.month()),
            day: i64::from(day.day()),
            month_name: day.format("%B").to_string(),
            quarter: i64::from((day.month() - 1) / 3 + 1),
        });
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Ok(rows)
}

// =============================================================================
// FACT ASSEMBLER - natural keys swapped for surrogate keys
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    sales_key: String,
    customer_key: i64,
    product_key: i64,
    date_key: i64,
    quantity: i64,
    price: f64,
    total: f64,
    deal_size: String,
}

/// Every clean record becomes exactly one fact row. A natural key that
/// misses its dimension means the dimensions were not built from this
/// record set; that is pipeline corruption and the run halts.
fn assemble_facts(
    records: &[CleanRecord],
    customers: &[CustomerRow],
    products: &[ProductRow],
    calendar: &[DateRow],
) -> Result<Vec<FactRow>> {
    let customer_keys: HashMap<(&str, &str, &str), i64> = customers
        .iter()
        .map(|c| {
            (
                (c.customer_name.as_str(), c.country.as_str(), c.city.as_str()),
                c.customer_key,
            )
        })
        .collect();
    let product_keys: HashMap<(&str, &str), i64> = products
        .iter()
        .map(|p| ((p.product_code.as_str(), p.product_line.as_str()), p.product_key))
        .collect();
    let date_keys: HashMap<NaiveDate, i64> = calendar
        .iter()
        .map(|d| (d.order_date, d.date_key))
        .collect();

    records
        .iter()
        .map(|record| {
            let customer_key = *customer_keys
                .get(&(
                    record.customer_name.as_str(),
                    record.country.as_str(),
                    record.city.as_str(),
                ))
                .with_context(|| {
                    format!(
                        "order {}: customer ({}, {}, {}) missing from dim_customer",
                        record.order_number, record.customer_name, record.country, record.city
                    )
                })?;
            let product_key = *product_keys
                .get(&(record.product_code.as_str(), record.product_line.as_str()))
                .with_context(|| {
                    format!(
                        "order {}: product ({}, {}) missing from dim_product",
                        record.order_number, record.product_code, record.product_line
                    )
                })?;
            let date_key = *date_keys.get(&record.order_date).with_context(|| {
                format!(
                    "order {}: date {} missing from dim_date",
                    record.order_number, record.order_date
                )
            })?;

            Ok(FactRow {
                sales_key: record.order_number.clone(),
                customer_key,
                product_key,
                date_key,
                quantity: record.quantity,
                price: record.price,
                total: record.total,
                deal_size: record.deal_size.clone(),
            })
        })
        .collect()
}

// =============================================================================
// PIPELINE - the pure core, no I/O
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Warehouse {
    clean: Vec<CleanRecord>,
    customers: Vec<CustomerRow>,
    products: Vec<ProductRow>,
    calendar: Vec<DateRow>,
    facts: Vec<FactRow>,
}

/// Run the full transform: normalize, filter/enrich, build dimensions,
/// assemble facts. Deterministic: same extract, same output.
fn build_warehouse(raw: &RawTable, schema: &ExtractSchema) -> Result<Warehouse> {
    let normalized = normalize_records(raw, schema);
    let clean = filter_and_enrich(normalized);
    if clean.is_empty() {
        anyhow::bail!("no shipped rows with a valid order date in the extract; nothing to load");
    }

    let customers = build_customer_dim(&clean);
    let products = build_product_dim(&clean);
    let calendar = build_date_dim(&clean)?;
    let facts = assemble_facts(&clean, &customers, &products, &calendar)?;

    Ok(Warehouse {
        clean,
        customers,
        products,
        calendar,
        facts,
    })
}

#[derive(Debug, Serialize)]
struct RunSummary {
    rows_read: usize,
    rows_clean: usize,
    customers: usize,
    products: usize,
    calendar_days: usize,
    facts: usize,
    date_min: NaiveDate,
    date_max: NaiveDate,
}

impl RunSummary {
    fn new(raw: &RawTable, warehouse: &Warehouse) -> Self {
        Self {
            rows_read: raw.rows.len(),
            rows_clean: warehouse.clean.len(),
            customers: warehouse.customers.len(),
            products: warehouse.products.len(),
            calendar_days: warehouse.calendar.len(),
            facts: warehouse.facts.len(),
            date_min: warehouse
                .calendar
                .first()
                .map(|d| d.order_date)
                .unwrap_or_default(),
            date_max: warehouse
                .calendar
                .last()
                .map(|d| d.order_date)
                .unwrap_or_default(),
        }
    }
}

// =============================================================================
// WAREHOUSE SINK - replace-table and execute-statement, behind a trait
// =============================================================================

const RAW_SCHEMA: &str = "raw";
const STAGING_SCHEMA: &str = "stg";
const ANALYTICS_SCHEMA: &str = "analytics";

const FACT_INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_fact_sales_custkey ON analytics.fact_sales (customer_key)",
    "CREATE INDEX IF NOT EXISTS idx_fact_sales_prodkey ON analytics.fact_sales (product_key)",
    "CREATE INDEX IF NOT EXISTS idx_fact_sales_datekey ON analytics.fact_sales (date_key)",
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum SqlType {
    Text,
    BigInt,
    Double,
    Date,
}

impl SqlType {
    fn sql_name(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Text(String),
    BigInt(i64),
    Double(f64),
    Date(NaiveDate),
    Null,
}

#[derive(Debug, Clone)]
struct ColumnSpec {
    name: String,
    ty: SqlType,
}

fn column(name: &str, ty: SqlType) -> ColumnSpec {
    ColumnSpec {
        name: name.to_string(),
        ty,
    }
}

#[derive(Debug, Clone)]
struct TableSpec {
    schema: &'static str,
    name: &'static str,
    columns: Vec<ColumnSpec>,
}

/// Raw extract headers end up as column names verbatim, so every
/// identifier is quoted with embedded quotes doubled.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl TableSpec {
    fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(self.schema), quote_ident(self.name))
    }

    fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_name()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({})", self.qualified_name(), columns)
    }

    fn insert_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let params = (1..=self.columns.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified_name(),
            columns,
            params
        )
    }
}

/// The relational sink boundary: full-replace table writes plus raw
/// statement execution. The core never talks to Postgres directly.
trait WarehouseSink {
    async fn replace_table(&mut self, spec: &TableSpec, rows: &[Vec<SqlValue>]) -> Result<()>;
    async fn execute_statement(&mut self, sql: &str) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
}

/// Postgres sink. Every write lands inside one transaction so an
/// interrupted run leaves the previous tables untouched.
struct PgSink {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSink {
    async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool
            .begin()
            .await
            .context("Failed to open warehouse transaction")?;
        Ok(Self { tx: Some(tx) })
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .context("warehouse transaction already committed")
    }
}

impl WarehouseSink for PgSink {
    async fn replace_table(&mut self, spec: &TableSpec, rows: &[Vec<SqlValue>]) -> Result<()> {
        let table = spec.qualified_name();
        let drop_sql = format!("DROP TABLE IF EXISTS {}", table);
        let create_sql = spec.create_sql();
        let insert_sql = spec.insert_sql();

        let tx = self.tx()?;
        sqlx::query(&drop_sql)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to drop {}", table))?;
        sqlx::query(&create_sql)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to create {}", table))?;

        for row in rows {
            let mut query = sqlx::query(&insert_sql);
            for value in row {
                query = match value {
                    SqlValue::Text(s) => query.bind(s.as_str()),
                    SqlValue::BigInt(n) => query.bind(*n),
                    SqlValue::Double(f) => query.bind(*f),
                    SqlValue::Date(d) => query.bind(*d),
                    SqlValue::Null => query.bind(Option::<&str>::None),
                };
            }
            query
                .execute(&mut **tx)
                .await
                .with_context(|| format!("Failed to insert into {}", table))?;
        }

        Ok(())
    }

    async fn execute_statement(&mut self, sql: &str) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(sql)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("Failed to execute: {}", sql))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .context("warehouse transaction already committed")?;
        tx.commit()
            .await
            .context("Failed to commit warehouse transaction")?;
        Ok(())
    }
}

// =============================================================================
// TABLE BUILDERS - in-memory tables to sink rows
// =============================================================================

fn raw_mirror_table(raw: &RawTable) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: RAW_SCHEMA,
        name: "sales_data",
        columns: raw
            .headers
            .iter()
            .map(|h| column(h, SqlType::Text))
            .collect(),
    };
    let rows = raw
        .rows
        .iter()
        .map(|row| {
            (0..raw.headers.len())
                .map(|i| match row.get(i) {
                    Some(cell) => SqlValue::Text(cell.clone()),
                    None => SqlValue::Null,
                })
                .collect()
        })
        .collect();
    (spec, rows)
}

fn staging_table(records: &[CleanRecord]) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: STAGING_SCHEMA,
        name: "clean_sales",
        columns: vec![
            column("order_number", SqlType::Text),
            column("order_date", SqlType::Date),
            column("product_code", SqlType::Text),
            column("product_line", SqlType::Text),
            column("customer_name", SqlType::Text),
            column("country", SqlType::Text),
            column("city", SqlType::Text),
            column("deal_size", SqlType::Text),
            column("quantity_ordered", SqlType::BigInt),
            column("price_each", SqlType::Double),
            column("total_sales", SqlType::Double),
        ],
    };
    let rows = records
        .iter()
        .map(|r| {
            vec![
                SqlValue::Text(r.order_number.clone()),
                SqlValue::Date(r.order_date),
                SqlValue::Text(r.product_code.clone()),
                SqlValue::Text(r.product_line.clone()),
                SqlValue::Text(r.customer_name.clone()),
                SqlValue::Text(r.country.clone()),
                SqlValue::Text(r.city.clone()),
                SqlValue::Text(r.deal_size.clone()),
                SqlValue::BigInt(r.quantity),
                SqlValue::Double(r.price),
                SqlValue::Double(r.total),
            ]
        })
        .collect();
    (spec, rows)
}

fn customer_dim_table(rows: &[CustomerRow]) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: ANALYTICS_SCHEMA,
        name: "dim_customer",
        columns: vec![
            column("customer_key", SqlType::BigInt),
            column("customer_name", SqlType::Text),
            column("country", SqlType::Text),
            column("city", SqlType::Text),
        ],
    };
    let data = rows
        .iter()
        .map(|r| {
            vec![
                SqlValue::BigInt(r.customer_key),
                SqlValue::Text(r.customer_name.clone()),
                SqlValue::Text(r.country.clone()),
                SqlValue::Text(r.city.clone()),
            ]
        })
        .collect();
    (spec, data)
}

fn product_dim_table(rows: &[ProductRow]) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: ANALYTICS_SCHEMA,
        name: "dim_product",
        columns: vec![
            column("product_key", SqlType::BigInt),
            column("product_code", SqlType::Text),
            column("product_line", SqlType::Text),
        ],
    };
    let data = rows
        .iter()
        .map(|r| {
            vec![
                SqlValue::BigInt(r.product_key),
                SqlValue::Text(r.product_code.clone()),
                SqlValue::Text(r.product_line.clone()),
            ]
        })
        .collect();
    (spec, data)
}

fn date_dim_table(rows: &[DateRow]) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: ANALYTICS_SCHEMA,
        name: "dim_date",
        columns: vec![
            column("date_key", SqlType::BigInt),
            column("order_date", SqlType::Date),
            column("year", SqlType::BigInt),
            column("month", SqlType::BigInt),
            column("day", SqlType::BigInt),
            column("month_name", SqlType::Text),
            column("quarter", SqlType::BigInt),
        ],
    };
    let data = rows
        .iter()
        .map(|r| {
            vec![
                SqlValue::BigInt(r.date_key),
                SqlValue::Date(r.order_date),
                SqlValue::BigInt(r.year),
                SqlValue::BigInt(r.month),
                SqlValue::BigInt(r.day),
                SqlValue::Text(r.month_name.clone()),
                SqlValue::BigInt(r.quarter),
            ]
        })
        .collect();
    (spec, data)
}

fn fact_table(rows: &[FactRow]) -> (TableSpec, Vec<Vec<SqlValue>>) {
    let spec = TableSpec {
        schema: ANALYTICS_SCHEMA,
        name: "fact_sales",
        columns: vec![
            column("sales_key", SqlType::Text),
            column("customer_key", SqlType::BigInt),
            column("product_key", SqlType::BigInt),
            column("date_key", SqlType::BigInt),
            column("quantity", SqlType::BigInt),
            column("price", SqlType::Double),
            column("total", SqlType::Double),
            column("deal_size", SqlType::Text),
        ],
    };
    let data = rows
        .iter()
        .map(|r| {
            vec![
                SqlValue::Text(r.sales_key.clone()),
                SqlValue::BigInt(r.customer_key),
                SqlValue::BigInt(r.product_key),
                SqlValue::BigInt(r.date_key),
                SqlValue::BigInt(r.quantity),
                SqlValue::Double(r.price),
                SqlValue::Double(r.total),
                SqlValue::Text(r.deal_size.clone()),
            ]
        })
        .collect();
    (spec, data)
}

/// Replace every warehouse table in dependency order (raw mirror,
/// staging, dimensions, then facts), create the fact indexes, commit.
async fn load_warehouse<S: WarehouseSink>(
    sink: &mut S,
    raw: &RawTable,
    warehouse: &Warehouse,
) -> Result<()> {
    let tables = [
        raw_mirror_table(raw),
        staging_table(&warehouse.clean),
        customer_dim_table(&warehouse.customers),
        product_dim_table(&warehouse.products),
        date_dim_table(&warehouse.calendar),
        fact_table(&warehouse.facts),
    ];

    for (spec, rows) in &tables {
        sink.replace_table(spec, rows).await?;
        println!("  ✓ {}.{} ({} rows)", spec.schema, spec.name, rows.len());
    }

    for statement in FACT_INDEX_STATEMENTS {
        sink.execute_statement(statement).await?;
    }
    println!("  ✓ fact table indexes ({})", FACT_INDEX_STATEMENTS.len());

    sink.commit().await?;
    Ok(())
}

// =============================================================================
// JOB RUNS - audit trail for live runs
// =============================================================================

async fn create_job_run(pool: &PgPool, input: &str, content_hash: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, source_id, status, detail)
        VALUES ($1, 'warehouse', $2, 'running', $3)
        "#,
    )
    .bind(job_run_id)
    .bind(input)
    .bind(serde_json::json!({ "content_hash": content_hash }))
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    summary: &RunSummary,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(serde_json::to_value(summary)?)
    .execute(pool)
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env()?;

    println!("=== Sales Warehouse Builder ===");
    println!("Input: {}", args.input);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read extract {}", args.input))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("sha256:{:x}", hasher.finalize());
    println!("Extract: {} bytes", bytes.len());
    println!("Hash: {}", content_hash);

    let raw = if is_excel_file(&args.input) {
        println!("Detected Excel workbook - reading first sheet");
        read_excel_extract(Path::new(&args.input))?
    } else {
        read_csv_extract(&decode_extract(&bytes))?
    };
    println!("Parsed {} rows x {} columns", raw.rows.len(), raw.headers.len());

    let schema = ExtractSchema::resolve(&raw.headers)?;
    let warehouse = build_warehouse(&raw, &schema)?;
    let summary = RunSummary::new(&raw, &warehouse);

    println!("\nCleaned {} shipped rows (of {} read)", summary.rows_clean, summary.rows_read);
    println!("dim_customer: {} rows", summary.customers);
    println!("dim_product: {} rows", summary.products);
    println!(
        "dim_date: {} rows ({} .. {})",
        summary.calendar_days, summary.date_min, summary.date_max
    );
    println!("fact_sales: {} rows", summary.facts);
    for (i, fact) in warehouse.facts.iter().take(3).enumerate() {
        println!(
            "  [{}] order {} | customer_key={} product_key={} date_key={} | total {:.2}",
            i + 1,
            fact.sales_key,
            fact.customer_key,
            fact.product_key,
            fact.date_key,
            fact.total
        );
    }
    if warehouse.facts.len() > 3 {
        println!("  ... and {} more", warehouse.facts.len() - 3);
    }

    if args.dry_run {
        println!("\nDry run - no tables written");
        return Ok(());
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    let job_run_id = create_job_run(&pool, &args.input, &content_hash).await?;

    let result = async {
        let mut sink = PgSink::begin(&pool).await?;
        println!("\nReplacing warehouse tables...");
        load_warehouse(&mut sink, &raw, &warehouse).await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    match &result {
        Ok(()) => finish_job_run(&pool, job_run_id, "ok", None, &summary).await?,
        Err(e) => finish_job_run(&pool, job_run_id, "failed", Some(&e.to_string()), &summary).await?,
    }
    result?;

    println!("\n=== Warehouse Build Complete ===");
    println!("Schemas: raw, stg, analytics");
    println!("Fact indexes ready for dimension joins");
    Ok(())
}

// =============================================================================
// TESTS - determinism and the star-schema invariants
// =============================================================================
