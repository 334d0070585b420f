use rhai::plugin::*;
use rhai::{Array, Dynamic, EvalAltResult, Module, Position};

/// The modules served to sandboxed scripts, in resolver order.
/// Both are also registered as static modules so scripts can call them
/// without an explicit `import`.
pub fn standard_library() -> Vec<(&'static str, Module)> {
    vec![
        ("num", exported_module!(num_module)),
        ("tab", exported_module!(tab_module)),
    ]
}

pub(crate) fn rt_err(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

pub(crate) fn to_floats(values: &Array, fn_name: &str) -> Result<Vec<f64>, Box<EvalAltResult>> {
    values
        .iter()
        .map(|v| {
            v.as_float().or_else(|_| v.as_int().map(|i| i as f64)).map_err(|_| {
                rt_err(format!(
                    "{fn_name} expects an array of numbers, found element of type '{}'",
                    v.type_name()
                ))
            })
        })
        .collect()
}

/// Vector math over plain float arrays, the numeric toolkit injected into
/// every strategy under the name `num`.
#[export_module]
mod num_module {
    use statrs::statistics::{Data, OrderStatistics, Statistics};

    use crate::exec::modules::{rt_err, to_floats};

    /// Arithmetic mean.
    #[rhai_fn(return_raw)]
    pub fn mean(values: Array) -> Result<f64, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::mean")?;
        if xs.is_empty() {
            return Err(rt_err("num::mean of an empty array"));
        }
        Ok(xs.iter().copied().mean())
    }

    /// Sample standard deviation (n - 1 denominator).
    #[rhai_fn(return_raw)]
    pub fn stdev(values: Array) -> Result<f64, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::stdev")?;
        if xs.len() < 2 {
            return Err(rt_err("num::stdev needs at least 2 values"));
        }
        Ok(xs.iter().copied().std_dev())
    }

    #[rhai_fn(return_raw)]
    pub fn median(values: Array) -> Result<f64, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::median")?;
        if xs.is_empty() {
            return Err(rt_err("num::median of an empty array"));
        }
        let mut data = Data::new(xs);
        Ok(data.median())
    }

    #[rhai_fn(return_raw)]
    pub fn sum(values: Array) -> Result<f64, Box<EvalAltResult>> {
        Ok(to_floats(&values, "num::sum")?.iter().sum())
    }

    #[rhai_fn(return_raw)]
    pub fn highest(values: Array) -> Result<f64, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::highest")?;
        xs.into_iter()
            .fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.max(x))))
            .ok_or_else(|| rt_err("num::highest of an empty array"))
    }

    #[rhai_fn(return_raw)]
    pub fn lowest(values: Array) -> Result<f64, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::lowest")?;
        xs.into_iter()
            .fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.min(x))))
            .ok_or_else(|| rt_err("num::lowest of an empty array"))
    }

    /// Simple percentage changes between consecutive values.
    /// Returns an array one element shorter than the input.
    #[rhai_fn(return_raw)]
    pub fn returns(values: Array) -> Result<Array, Box<EvalAltResult>> {
        let xs = to_floats(&values, "num::returns")?;
        Ok(xs
            .windows(2)
            .map(|w| Dynamic::from_float((w[1] - w[0]) / w[0]))
            .collect())
    }

    /// Simple moving average with the given window.
    /// Returns one value per full window; shorter input yields an empty array.
    #[rhai_fn(return_raw)]
    pub fn sma(values: Array, window: i64) -> Result<Array, Box<EvalAltResult>> {
        if window <= 0 {
            return Err(rt_err("num::sma window must be > 0"));
        }
        let xs = to_floats(&values, "num::sma")?;
        let window = window as usize;
        Ok(xs
            .windows(window)
            .map(|w| Dynamic::from_float(w.iter().sum::<f64>() / window as f64))
            .collect())
    }

    /// Exponential moving average with smoothing `2 / (span + 1)`, seeded
    /// from the first value. Output has the same length as the input.
    #[rhai_fn(return_raw)]
    pub fn ema(values: Array, span: i64) -> Result<Array, Box<EvalAltResult>> {
        if span <= 0 {
            return Err(rt_err("num::ema span must be > 0"));
        }
        let xs = to_floats(&values, "num::ema")?;
        let alpha = 2.0 / (span as f64 + 1.0);
        let mut out = Array::with_capacity(xs.len());
        let mut current: Option<f64> = None;
        for x in xs {
            let next = match current {
                None => x,
                Some(prev) => alpha * x + (1.0 - alpha) * prev,
            };
            current = Some(next);
            out.push(Dynamic::from_float(next));
        }
        Ok(out)
    }
}

/// Column extraction from the OHLCV row array handed to strategies, the
/// tabular toolkit injected under the name `tab`.
#[export_module]
mod tab_module {
    use rhai::Map;

    use crate::exec::modules::rt_err;

    fn column(rows: &mut Array, key: &str) -> Result<Array, Box<EvalAltResult>> {
        rows.iter()
            .map(|row| {
                let map = row.read_lock::<Map>().ok_or_else(|| {
                    rt_err(format!(
                        "tab::{key} expects an array of row maps, found element of type '{}'",
                        row.type_name()
                    ))
                })?;
                map.get(key)
                    .cloned()
                    .ok_or_else(|| rt_err(format!("row has no '{key}' field")))
            })
            .collect()
    }

    #[rhai_fn(return_raw)]
    pub fn dates(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "date")
    }

    #[rhai_fn(return_raw)]
    pub fn opens(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "open")
    }

    #[rhai_fn(return_raw)]
    pub fn highs(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "high")
    }

    #[rhai_fn(return_raw)]
    pub fn lows(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "low")
    }

    #[rhai_fn(return_raw)]
    pub fn closes(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "close")
    }

    #[rhai_fn(return_raw)]
    pub fn volumes(mut rows: Array) -> Result<Array, Box<EvalAltResult>> {
        column(&mut rows, "volume")
    }

    /// Close of the most recent row.
    #[rhai_fn(return_raw)]
    pub fn last_close(mut rows: Array) -> Result<f64, Box<EvalAltResult>> {
        let closes = column(&mut rows, "close")?;
        let last = closes.last().ok_or_else(|| rt_err("tab::last_close of an empty table"))?;
        last.as_float()
            .or_else(|_| last.as_int().map(|i| i as f64))
            .map_err(|_| rt_err("row 'close' field is not numeric"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Map;

    fn floats(xs: &[f64]) -> Array {
        xs.iter().map(|x| Dynamic::from_float(*x)).collect()
    }

    fn library_engine() -> rhai::Engine {
        let mut engine = rhai::Engine::new();
        for (name, module) in standard_library() {
            engine.register_static_module(name, module.into());
        }
        engine
    }

    #[test]
    fn mean_and_stdev() {
        let engine = library_engine();
        let m: f64 = engine.eval("num::mean([1.0, 2.0, 3.0, 4.0, 5.0])").unwrap();
        assert!((m - 3.0).abs() < 1e-12);
        // Sample variance of 1..5 is 2.5.
        let s: f64 = engine.eval("num::stdev([1.0, 2.0, 3.0, 4.0, 5.0])").unwrap();
        assert!((s - 2.5_f64.sqrt()).abs() < 1e-9, "got {s}");
    }

    #[test]
    fn mean_accepts_integers() {
        let engine = library_engine();
        let m: f64 = engine.eval("num::mean([1, 2, 3])").unwrap();
        assert!((m - 2.0).abs() < 1e-12);
    }

    #[test]
    fn mean_of_empty_is_an_error() {
        let engine = library_engine();
        let err = engine.eval::<f64>("num::mean([])").unwrap_err().to_string();
        assert!(err.contains("empty"), "got: {err}");
    }

    #[test]
    fn median_odd_and_even() {
        let engine = library_engine();
        let odd: f64 = engine.eval("num::median([3.0, 1.0, 2.0])").unwrap();
        assert!((odd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn sma_windows() {
        let engine = library_engine();
        let out: Array = engine.eval("num::sma([1.0, 2.0, 3.0, 4.0], 2)").unwrap();
        let out: Vec<f64> = out.iter().map(|d| d.as_float().unwrap()).collect();
        assert_eq!(out, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn sma_short_input_is_empty() {
        let engine = library_engine();
        let out: Array = engine.eval("num::sma([1.0], 5)").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn ema_seeds_from_first_value() {
        let engine = library_engine();
        let out: Array = engine.eval("num::ema([10.0, 20.0], 1)").unwrap();
        let out: Vec<f64> = out.iter().map(|d| d.as_float().unwrap()).collect();
        // alpha = 1 with span 1: follows the input exactly.
        assert_eq!(out, vec![10.0, 20.0]);
    }

    #[test]
    fn returns_are_pairwise() {
        let engine = library_engine();
        let out: Array = engine.eval("num::returns([100.0, 110.0, 99.0])").unwrap();
        let out: Vec<f64> = out.iter().map(|d| d.as_float().unwrap()).collect();
        assert!((out[0] - 0.10).abs() < 1e-12);
        assert!((out[1] - (-0.1)).abs() < 1e-12);
    }

    #[test]
    fn tab_extracts_columns() {
        let mut row1 = Map::new();
        row1.insert("date".into(), Dynamic::from("2024-01-01"));
        row1.insert("close".into(), Dynamic::from_float(100.0));
        let mut row2 = Map::new();
        row2.insert("date".into(), Dynamic::from("2024-01-02"));
        row2.insert("close".into(), Dynamic::from_float(105.0));
        let rows: Array = vec![Dynamic::from_map(row1), Dynamic::from_map(row2)];

        let engine = library_engine();
        let mut scope = rhai::Scope::new();
        scope.push("rows", rows);
        let closes: Array = engine
            .eval_with_scope(&mut scope, "tab::closes(rows)")
            .unwrap();
        assert_eq!(closes.len(), 2);
        let last: f64 = engine
            .eval_with_scope(&mut scope, "tab::last_close(rows)")
            .unwrap();
        assert!((last - 105.0).abs() < 1e-12);
    }

    #[test]
    fn tab_missing_field_is_an_error() {
        let mut row = Map::new();
        row.insert("close".into(), Dynamic::from_float(1.0));
        let rows: Array = vec![Dynamic::from_map(row)];

        let engine = library_engine();
        let mut scope = rhai::Scope::new();
        scope.push("rows", rows);
        let err = engine
            .eval_with_scope::<Array>(&mut scope, "tab::opens(rows)")
            .unwrap_err()
            .to_string();
        assert!(err.contains("open"), "got: {err}");
    }
}
