use chrono::{DateTime, Utc};
use serde::Serialize;

/// A validated order, as produced by the parser and written to the warehouse.
///
/// The serialized form is the wire format shared with upstream producers:
/// a JSON object with `order_id`, `user_id`, `product_id` (strings),
/// `amount` (number) and `event_time` (ISO-8601 string). Decoding goes
/// through [`crate::parse::parse`], never through `Deserialize`, so that
/// every rejection carries a reason.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub user_id: String,
    pub product_id: String,
    pub amount: f64,
    pub event_time: DateTime<Utc>,
}

impl OrderEvent {
    /// Idempotency key used by the warehouse upsert and for dedup on replay.
    pub fn key(&self) -> &str {
        &self.order_id
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_format_is_stable() {
        let event = OrderEvent {
            order_id: "A1".to_string(),
            user_id: "U1".to_string(),
            product_id: "P1".to_string(),
            amount: 12.5,
            event_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };

        let encoded: serde_json::Value =
            serde_json::from_slice(&event.to_json().unwrap()).unwrap();

        assert_json_eq!(
            encoded,
            json!({
                "order_id": "A1",
                "user_id": "U1",
                "product_id": "P1",
                "amount": 12.5,
                "event_time": "2024-01-01T00:00:00Z"
            })
        );
        assert_eq!(event.key(), "A1");
    }
}
