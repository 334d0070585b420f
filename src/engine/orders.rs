use garde::Validate;
use serde_json::Value;

/// An order to convert USD cash into a new BTC holding, with optional
/// exit thresholds attached.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct BuyOrder {
    #[garde(custom(validate_positive))]
    pub amount: f64,
    #[garde(inner(custom(validate_positive)))]
    pub stop_loss: Option<f64>,
    #[garde(inner(custom(validate_positive)))]
    pub take_profit: Option<f64>,
}

/// An order to convert (part of) an existing BTC holding back into USD.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct SellOrder {
    #[garde(length(min = 1))]
    pub holding_id: String,
    #[garde(custom(validate_positive))]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Order {
    Buy(BuyOrder),
    Sell(SellOrder),
}

fn validate_positive(value: &f64, (): &()) -> garde::Result {
    if *value > 0.0 {
        Ok(())
    } else {
        Err(garde::Error::new("must be strictly positive"))
    }
}

const BUY_FIELDS: [&str; 5] = ["action", "asset", "amount", "stop_loss", "take_profit"];
const SELL_FIELDS: [&str; 3] = ["action", "holding_id", "amount"];

/// Validate a strategy's raw return value into a list of orders.
///
/// `Null` is treated as "no orders". Anything other than a list is
/// rejected, and a single ill-formed element rejects the whole list; there
/// is no partial acceptance.
pub fn parse_orders(raw: &Value) -> Result<Vec<Order>, String> {
    let items = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => {
            return Err(
                "run(df, holdings) must return a list of orders (or an empty list).".to_string(),
            )
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            parse_order(item).map_err(|e| format!("invalid order payload(s): order {i}: {e}"))
        })
        .collect()
}

fn parse_order(value: &Value) -> Result<Order, String> {
    let map = value
        .as_object()
        .ok_or_else(|| format!("expected a mapping, found {}", type_name(value)))?;

    let action = map
        .get("action")
        .ok_or("missing 'action' field")?
        .as_str()
        .ok_or("'action' must be a string")?;

    let order = match action {
        "BUY" => {
            reject_unknown_fields(map, &BUY_FIELDS, "BUY")?;
            let asset = map
                .get("asset")
                .ok_or("BUY requires an 'asset' field")?
                .as_str()
                .ok_or("'asset' must be a string")?;
            if asset != "BTC" {
                return Err(format!("BUY asset must be \"BTC\", found {asset:?}"));
            }
            Order::Buy(BuyOrder {
                amount: number_field(map, "amount")?,
                stop_loss: optional_number_field(map, "stop_loss")?,
                take_profit: optional_number_field(map, "take_profit")?,
            })
        }
        "SELL" => {
            reject_unknown_fields(map, &SELL_FIELDS, "SELL")?;
            let holding_id = map
                .get("holding_id")
                .ok_or("SELL requires a 'holding_id' field")?
                .as_str()
                .ok_or("'holding_id' must be a string")?;
            Order::Sell(SellOrder {
                holding_id: holding_id.to_string(),
                amount: number_field(map, "amount")?,
            })
        }
        other => {
            return Err(format!(
                "unsupported action {other:?} (expected \"BUY\" or \"SELL\")"
            ))
        }
    };

    match &order {
        Order::Buy(o) => o.validate().map_err(|r| r.to_string())?,
        Order::Sell(o) => o.validate().map_err(|r| r.to_string())?,
    }
    Ok(order)
}

fn reject_unknown_fields(
    map: &serde_json::Map<String, Value>,
    allowed: &[&str],
    action: &str,
) -> Result<(), String> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(format!("unexpected field '{key}' for {action}"));
        }
    }
    Ok(())
}

fn number_field(map: &serde_json::Map<String, Value>, key: &str) -> Result<f64, String> {
    map.get(key)
        .ok_or_else(|| format!("missing '{key}' field"))?
        .as_f64()
        .ok_or_else(|| format!("'{key}' must be a number"))
}

fn optional_number_field(
    map: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<f64>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("'{key}' must be a number or null")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
