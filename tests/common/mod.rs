#![allow(dead_code)]

use std::io::Write;

use btc_backtest::data;
use btc_backtest::engine::Backtester;

/// Five daily candles with BTC-style continuity (`open[t] == close[t-1]`)
/// and logical OHLC constraints (`low <= min(open, close)`,
/// `high >= max(open, close)`):
///
///   | Date       | Open | High | Low | Close |
///   |------------|------|------|-----|-------|
///   | 2024-01-01 | 100  | 102  | 98  | 100   |
///   | 2024-01-02 | 100  | 112  | 95  | 105   |
///   | 2024-01-03 | 105  | 120  | 100 | 110   |
///   | 2024-01-04 | 110  | 121  | 108 | 120   |
///   | 2024-01-05 | 120  | 130  | 115 | 125   |
pub const BTC_CSV: &str = "\
Date,Open,High,Low,Close,Volume
2024-01-01,100,102,98,100,1
2024-01-02,100,112,95,105,1
2024-01-03,105,120,100,110,1
2024-01-04,110,121,108,120,1
2024-01-05,120,130,115,125,1
";

/// Load the fixture through the full CSV path, as a caller would.
pub fn make_backtester() -> Backtester {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(BTC_CSV.as_bytes()).unwrap();
    file.flush().unwrap();
    let table = data::csv::load_table(file.path()).unwrap();
    Backtester::new(table)
}
