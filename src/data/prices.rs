use anyhow::{bail, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A single trading day's OHLCV record. Bars are created at table load and
/// never mutated afterwards.
///
/// By dataset convention `low <= min(open, close)` and
/// `high >= max(open, close)`; the engine relies on this but does not
/// re-validate it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Immutable, date-ordered table of daily bars with unique dates.
///
/// The full table lives in memory (roughly a decade of daily candles), so
/// slicing is plain binary search over the sorted `Vec`.
#[derive(Debug, Clone)]
pub struct PriceTable {
    bars: Vec<Bar>,
}

impl PriceTable {
    /// Build a table from unordered bars. Sorts ascending by date and
    /// rejects duplicate dates.
    pub fn from_bars(mut bars: Vec<Bar>) -> Result<Self> {
        bars.sort_by_key(|b| b.date);
        for pair in bars.windows(2) {
            if pair[0].date == pair[1].date {
                bail!("duplicate date in price table: {}", pair[0].date);
            }
        }
        Ok(Self { bars })
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn all(&self) -> &[Bar] {
        &self.bars
    }

    pub fn min_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn max_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    /// All bars with `date <= cutoff`. The comparison is inclusive: the
    /// cutoff day's own bar is part of the prefix.
    pub fn prefix_until(&self, cutoff: NaiveDate) -> &[Bar] {
        let end = self.bars.partition_point(|b| b.date <= cutoff);
        &self.bars[..end]
    }

    /// The bar recorded on exactly `date`, if any.
    pub fn bar_on(&self, date: NaiveDate) -> Option<&Bar> {
        self.bars
            .binary_search_by_key(&date, |b| b.date)
            .ok()
            .map(|i| &self.bars[i])
    }

    /// Bars with `start <= date <= end`.
    ///
    /// Fails when the endpoints are inverted, when either endpoint lies
    /// outside the dataset bounds, or when the subset is empty despite
    /// being inside bounds.
    pub fn range(&self, start: NaiveDate, end: NaiveDate) -> Result<&[Bar]> {
        if start > end {
            bail!("Invalid range: start ({start}) is after end ({end}).");
        }

        let (Some(min), Some(max)) = (self.min_date(), self.max_date()) else {
            bail!("Price table is empty.");
        };

        if start < min || end > max {
            bail!(
                "Date range is outside the dataset bounds: requested [{start} .. {end}], \
                 available [{min} .. {max}]."
            );
        }

        let lo = self.bars.partition_point(|b| b.date < start);
        let hi = self.bars.partition_point(|b| b.date <= end);
        let subset = &self.bars[lo..hi];
        if subset.is_empty() {
            bail!(
                "No rows found in range [{start} .. {end}]. \
                 The dataset may not contain those specific dates."
            );
        }
        Ok(subset)
    }

    /// The trading dates of `range(start, end)`, in ascending order.
    pub fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        Ok(self.range(start, end)?.iter().map(|b| b.date).collect())
    }
}

/// Parse a calendar day from an ISO date string. A date-time value with
/// intraday components is accepted and normalized to its calendar day.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(d);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(dt.date());
        }
    }
    bail!("could not parse {value:?} as a calendar date")
}
