//! Parse model output into validated recommendations.
//! Accepts a bare JSON array or an object with a `recommendations` array.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;
use crate::types::{Action, Recommendation};
use crate::utils::sanitize_symbol;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    List(Vec<Value>),
    Wrapped { recommendations: Vec<Value> },
    Other(Value),
}

impl Payload {
    fn into_items(self) -> Vec<Value> {
        match self {
            Payload::List(items) | Payload::Wrapped { recommendations: items } => items,
            Payload::Other(_) => Vec::new(),
        }
    }
}

/// Strict JSON decode; malformed text is an error, unexpected shapes are empty.
/// Invalid elements are dropped; at most `max` valid ones are kept.
pub fn parse_recommendations(raw: &str, max: usize) -> Result<Vec<Recommendation>, EngineError> {
    let payload: Payload = serde_json::from_str(raw.trim())
        .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

    let mut out = Vec::new();
    for (i, item) in payload.into_items().iter().enumerate() {
        match validate(item) {
            Ok(rec) => {
                if out.len() == max {
                    warn!("recommendation limit {} reached, ignoring the rest", max);
                    break;
                }
                out.push(rec);
            }
            Err(reason) => warn!("dropping recommendation #{}: {}", i, reason),
        }
    }
    Ok(out)
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

fn validate(item: &Value) -> Result<Recommendation, String> {
    let action = item
        .get("action")
        .and_then(Value::as_str)
        .and_then(Action::parse)
        .ok_or("action must be buy, sell or hold")?;

    let symbol = item
        .get("symbol")
        .and_then(Value::as_str)
        .map(sanitize_symbol)
        .filter(|s| !s.is_empty())
        .ok_or("symbol must be a non-empty string")?;

    let shares = match action {
        Action::Hold => 0.0,
        Action::Buy | Action::Sell => item
            .get("shares")
            .and_then(as_number)
            .filter(|s| *s > 0.0)
            .ok_or_else(|| format!("{symbol}: shares must be a number > 0"))?,
    };

    let reason = item
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let confidence = item
        .get("confidence")
        .and_then(as_number)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    Ok(Recommendation {
        action,
        symbol,
        shares,
        reason,
        confidence,
    })
}
