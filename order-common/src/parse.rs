use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::OrderEvent;

/// Why a raw message could not become an [`OrderEvent`].
///
/// These are data errors: retrying cannot fix them, so rejected messages go
/// straight to the dead-letter sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("payload is not valid UTF-8 JSON")]
    MalformedEncoding,
    #[error("field {field} is missing or not a {expected}")]
    SchemaMismatch {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field {field} has invalid value {value}")]
    InvalidValue { field: &'static str, value: String },
}

impl RejectionReason {
    /// Stable code used for metric labels and dead-letter records.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::MalformedEncoding => "malformed_encoding",
            RejectionReason::SchemaMismatch { .. } => "schema_mismatch",
            RejectionReason::InvalidValue { .. } => "invalid_value",
        }
    }
}

/// Decode and validate one raw message.
///
/// Checks run in three passes and the first failing pass decides the reason:
/// decoding, then presence and type of every field, then field values.
/// Unknown fields are ignored. Pure, so workers call it concurrently.
pub fn parse(raw: &[u8]) -> Result<OrderEvent, RejectionReason> {
    let text = std::str::from_utf8(raw).map_err(|_| RejectionReason::MalformedEncoding)?;
    let value: Value =
        serde_json::from_str(text).map_err(|_| RejectionReason::MalformedEncoding)?;

    let Value::Object(fields) = value else {
        return Err(RejectionReason::SchemaMismatch {
            field: "$",
            expected: "object",
        });
    };

    let order_id = string_field(&fields, "order_id")?;
    let user_id = string_field(&fields, "user_id")?;
    let product_id = string_field(&fields, "product_id")?;
    let amount = number_field(&fields, "amount")?;
    let event_time = string_field(&fields, "event_time")?;

    for (field, value) in [
        ("order_id", order_id),
        ("user_id", user_id),
        ("product_id", product_id),
    ] {
        if value.trim().is_empty() {
            return Err(RejectionReason::InvalidValue {
                field,
                value: format!("{value:?}"),
            });
        }
    }

    if !amount.is_finite() || amount <= 0.0 {
        return Err(RejectionReason::InvalidValue {
            field: "amount",
            value: amount.to_string(),
        });
    }

    let event_time = parse_event_time(event_time).ok_or_else(|| RejectionReason::InvalidValue {
        field: "event_time",
        value: event_time.to_owned(),
    })?;

    Ok(OrderEvent {
        order_id: order_id.to_owned(),
        user_id: user_id.to_owned(),
        product_id: product_id.to_owned(),
        amount,
        event_time,
    })
}

fn string_field<'a>(
    fields: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, RejectionReason> {
    fields
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RejectionReason::SchemaMismatch {
            field,
            expected: "string",
        })
}

/// Numbers keep their source text, so an out-of-range literal reads as an
/// infinite value here instead of failing the decode.
fn number_field(fields: &Map<String, Value>, field: &'static str) -> Result<f64, RejectionReason> {
    match fields.get(field) {
        Some(Value::Number(number)) => {
            let text = number.to_string();
            text.parse::<f64>()
                .map_err(|_| RejectionReason::InvalidValue { field, value: text })
        }
        _ => Err(RejectionReason::SchemaMismatch {
            field,
            expected: "number",
        }),
    }
}

/// Accepts RFC 3339 timestamps, and ISO-8601 timestamps without an offset
/// (read as UTC) since upstream producers emit `utcnow().isoformat()`.
pub fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
