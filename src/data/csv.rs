use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use polars::prelude::*;
use std::path::Path;

use super::prices::{parse_date, Bar, PriceTable};

/// The date column expected in the source CSV.
pub const DATE_COL: &str = "Date";

/// Columns a historical OHLCV CSV must carry. Extra columns are ignored.
pub const REQUIRED_COLUMNS: [&str; 6] = ["Date", "Open", "High", "Low", "Close", "Volume"];

/// Load a daily OHLCV CSV into a [`PriceTable`].
pub fn load_table(path: impl AsRef<Path>) -> Result<PriceTable> {
    let df = read_ohlcv_csv(path.as_ref())?;
    table_from_dataframe(&df)
}

pub fn read_ohlcv_csv(path: &Path) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("Failed to read CSV file {}", path.display()))
}

/// Extract the required columns from a raw `DataFrame` into an owned table.
pub fn table_from_dataframe(df: &DataFrame) -> Result<PriceTable> {
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !df.schema().contains(c))
        .collect();
    if !missing.is_empty() {
        bail!("CSV is missing required columns: {missing:?}");
    }

    let dates = df.column(DATE_COL)?;
    let open = df.column("Open")?.cast(&DataType::Float64)?;
    let high = df.column("High")?.cast(&DataType::Float64)?;
    let low = df.column("Low")?.cast(&DataType::Float64)?;
    let close = df.column("Close")?.cast(&DataType::Float64)?;
    let volume = df.column("Volume")?.cast(&DataType::Int64)?;

    let open = open.f64()?;
    let high = high.f64()?;
    let low = low.f64()?;
    let close = close.f64()?;
    let volume = volume.i64()?;

    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        bars.push(Bar {
            date: extract_date_from_column(dates, i)?,
            open: required_f64(open, "Open", i)?,
            high: required_f64(high, "High", i)?,
            low: required_f64(low, "Low", i)?,
            close: required_f64(close, "Close", i)?,
            volume: volume
                .get(i)
                .with_context(|| format!("Null Volume at row {i}"))?
                .max(0) as u64,
        });
    }

    PriceTable::from_bars(bars)
}

fn required_f64(ca: &Float64Chunked, name: &str, idx: usize) -> Result<f64> {
    ca.get(idx)
        .with_context(|| format!("Null {name} at row {idx}"))
}

/// Extract a `NaiveDate` from a column value at a given index.
/// Handles String, Date and Datetime column types.
fn extract_date_from_column(col: &Column, idx: usize) -> Result<NaiveDate> {
    match col.dtype() {
        DataType::String => {
            let raw = match col.str()?.get(idx) {
                Some(s) => s,
                None => bail!("Null date at row {idx}"),
            };
            parse_date(raw).with_context(|| format!("Unparseable date at row {idx}"))
        }
        DataType::Date => {
            let Some(d) = col.date()?.phys.get(idx) else {
                bail!("Null date at row {idx}");
            };
            // stored as days since 1970-01-01; chrono counts from CE
            chrono::NaiveDate::from_num_days_from_ce_opt(d + 719_163)
                .with_context(|| format!("Invalid date at row {idx}"))
        }
        DataType::Datetime(tu, _) => {
            let Some(v) = col.datetime()?.phys.get(idx) else {
                bail!("Null datetime at row {idx}");
            };
            let micros = match tu {
                TimeUnit::Milliseconds => v.checked_mul(1_000),
                TimeUnit::Microseconds => Some(v),
                TimeUnit::Nanoseconds => Some(v / 1_000),
            };
            micros
                .and_then(chrono::DateTime::from_timestamp_micros)
                .map(|dt| dt.naive_utc().date())
                .with_context(|| format!("Invalid datetime value at row {idx}"))
        }
        other => bail!("Unsupported Date column type: {other:?}"),
    }
}
