// Message builder - turns a payload into the document stored in the index
//
// JSON object payloads keep their fields; everything else (plain text,
// arrays, scalars, broken JSON) is wrapped as {"message": <payload>}.
// Both get a "datetime" field with the ingestion time in UTC.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

pub const DATETIME_FIELD: &str = "datetime";
pub const MESSAGE_FIELD: &str = "message";

/// Never fails: anything that is not a JSON object degrades to plain text.
///
/// An existing "datetime" field in the payload is overwritten with the
/// ingestion time.
pub fn build_document(payload: &str, now: DateTime<Utc>) -> Document {
    let datetime = Value::String(now.to_rfc3339_opts(SecondsFormat::AutoSi, true));

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(mut fields)) => {
            fields.insert(DATETIME_FIELD.to_string(), datetime);
            fields
        }
        _ => {
            let mut doc = Map::new();
            doc.insert(MESSAGE_FIELD.to_string(), Value::String(payload.to_string()));
            doc.insert(DATETIME_FIELD.to_string(), datetime);
            doc
        }
    }
}
