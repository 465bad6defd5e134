//! Source and canonical record types
//!
//! Source records mirror the Mixpanel export payloads. Canonical records are
//! the CleverTap upload shape produced by normalization.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Upper bound on the number of data entries in a canonical record.
pub const MAX_PROPERTIES: usize = 255;

/// Source properties keyed by name. JSON `null` becomes `None`.
pub type Properties = BTreeMap<String, Option<PropertyValue>>;

/// A property value, classified once when the record is parsed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Value")]
pub enum PropertyValue {
    String(String),
    Number(Number),
    List(Vec<PropertyValue>),
    /// Booleans, objects, and anything nested inside a list that is not a scalar.
    Other(Value),
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => PropertyValue::String(s),
            Value::Number(n) => PropertyValue::Number(n),
            Value::Array(items) => PropertyValue::List(items.into_iter().map(list_element).collect()),
            other => PropertyValue::Other(other),
        }
    }
}

fn list_element(value: Value) -> PropertyValue {
    match value {
        Value::String(s) => PropertyValue::String(s),
        Value::Number(n) => PropertyValue::Number(n),
        other => PropertyValue::Other(other),
    }
}

impl PropertyValue {
    /// The value as JSON, lists kept as arrays.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Number(n) => Value::Number(n.clone()),
            PropertyValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            PropertyValue::Other(v) => v.clone(),
        }
    }

    /// The value as JSON with lists joined into one comma-separated string.
    ///
    /// Only string and number elements contribute to the joined string.
    pub fn to_flat_json(&self) -> Value {
        match self {
            PropertyValue::List(items) => {
                let joined = items
                    .iter()
                    .filter_map(|item| match item {
                        PropertyValue::String(s) => Some(s.clone()),
                        PropertyValue::Number(n) => Some(format_number(n)),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                Value::String(joined)
            },
            other => other.to_json(),
        }
    }

    /// Interpret the value as an identity string.
    pub fn as_identity(&self) -> Option<String> {
        match self {
            PropertyValue::String(s) if !s.is_empty() => Some(s.clone()),
            PropertyValue::Number(n) => Some(format_number(n)),
            _ => None,
        }
    }

    /// Interpret the value as a unix timestamp in seconds.
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            PropertyValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            PropertyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Integral floats print without a fractional part, like the exporter's own formatting.
fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// One user profile from the engage export.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileRecord {
    #[serde(rename = "$distinct_id", default, deserialize_with = "lenient_string")]
    pub identity: String,
    #[serde(rename = "$properties", default, deserialize_with = "null_as_empty")]
    pub properties: Properties,
}

/// One event line from the raw export.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "event", default, deserialize_with = "lenient_string")]
    pub event_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Properties,
}

/// A raw record as emitted by a source generator.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Profile(ProfileRecord),
    Event(EventRecord),
}

/// Accept strings and numbers, treat anything else (including null) as empty.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => format_number(&n),
        _ => String::new(),
    })
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Properties, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Properties>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Profile,
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Payload {
    Profile {
        #[serde(rename = "profileData")]
        data: Map<String, Value>,
    },
    Event {
        #[serde(rename = "evtName")]
        name: String,
        #[serde(rename = "evtData")]
        data: Map<String, Value>,
    },
}

/// A destination-ready record.
///
/// Serializes to `{identity, ts, type: "profile", profileData}` or
/// `{identity, ts, type: "event", evtName, evtData}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    identity: String,
    ts: i64,
    #[serde(flatten)]
    payload: Payload,
}

impl CanonicalRecord {
    /// Build a profile record. `None` if the identity is empty or there are too many properties.
    pub fn profile(identity: impl Into<String>, ts: i64, data: Map<String, Value>) -> Option<Self> {
        Self::new(identity.into(), ts, data.len(), Payload::Profile { data })
    }

    /// Build an event record. `None` if the identity is empty or there are too many properties.
    pub fn event(
        identity: impl Into<String>,
        ts: i64,
        name: impl Into<String>,
        data: Map<String, Value>,
    ) -> Option<Self> {
        let len = data.len();
        let payload = Payload::Event {
            name: name.into(),
            data,
        };
        Self::new(identity.into(), ts, len, payload)
    }

    fn new(identity: String, ts: i64, len: usize, payload: Payload) -> Option<Self> {
        if identity.is_empty() || len > MAX_PROPERTIES {
            return None;
        }
        Some(Self {
            identity,
            ts,
            payload,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn timestamp(&self) -> i64 {
        self.ts
    }

    pub fn kind(&self) -> RecordKind {
        match self.payload {
            Payload::Profile { .. } => RecordKind::Profile,
            Payload::Event { .. } => RecordKind::Event,
        }
    }

    /// Event name; `None` for profiles.
    pub fn name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Profile { .. } => None,
            Payload::Event { name, .. } => Some(name),
        }
    }

    pub fn data(&self) -> &Map<String, Value> {
        match &self.payload {
            Payload::Profile { data } | Payload::Event { data, .. } => data,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_property_value_classification() {
        let record: EventRecord = serde_json::from_value(json!({
            "event": "Purchase",
            "properties": {
                "plan": "pro",
                "amount": 9.5,
                "tags": ["a", 1, true],
                "flag": false,
                "missing": null
            }
        }))
        .unwrap();

        let props = &record.properties;
        assert_eq!(props["plan"], Some(PropertyValue::String("pro".into())));
        assert!(matches!(props["amount"], Some(PropertyValue::Number(_))));
        assert_eq!(props["flag"], Some(PropertyValue::Other(json!(false))));
        assert_eq!(props["missing"], None);
        match &props["tags"] {
            Some(PropertyValue::List(items)) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[2], PropertyValue::Other(json!(true)));
            },
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_json_joins_scalars() {
        let value = PropertyValue::from(json!(["a", 2, 2.5, 3.0, {"x": 1}, null, "b"]));
        assert_eq!(value.to_flat_json(), json!("a,2,2.5,3,b"));
        assert_eq!(value.to_json(), json!(["a", 2, 2.5, 3.0, {"x": 1}, null, "b"]));
    }

    #[test]
    fn test_profile_identity_accepts_numbers() {
        let record: ProfileRecord =
            serde_json::from_value(json!({"$distinct_id": 42, "$properties": {}})).unwrap();
        assert_eq!(record.identity, "42");

        let record: ProfileRecord = serde_json::from_value(json!({"$properties": {}})).unwrap();
        assert_eq!(record.identity, "");
    }

    #[test]
    fn test_null_properties_are_empty() {
        let record: ProfileRecord =
            serde_json::from_value(json!({"$distinct_id": "u2", "$properties": null})).unwrap();
        assert_eq!(record.identity, "u2");
        assert!(record.properties.is_empty());

        let record: EventRecord =
            serde_json::from_value(json!({"event": "Login", "properties": null})).unwrap();
        assert_eq!(record.event_name, "Login");
        assert!(record.properties.is_empty());

        assert!(serde_json::from_value::<ProfileRecord>(json!({"$properties": 5})).is_err());
    }

    #[test]
    fn test_timestamp_conversion() {
        assert_eq!(PropertyValue::from(json!(1000)).as_timestamp(), Some(1000));
        assert_eq!(PropertyValue::from(json!(1000.9)).as_timestamp(), Some(1000));
        assert_eq!(PropertyValue::from(json!("1000")).as_timestamp(), Some(1000));
        assert_eq!(PropertyValue::from(json!("yesterday")).as_timestamp(), None);
    }

    #[test]
    fn test_canonical_profile_shape() {
        let mut data = Map::new();
        data.insert("Name".into(), json!("Ada"));
        let record = CanonicalRecord::profile("u1", 1700000000, data).unwrap();

        assert_eq!(record.kind(), RecordKind::Profile);
        assert_eq!(record.name(), None);
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"identity": "u1", "ts": 1700000000, "type": "profile", "profileData": {"Name": "Ada"}})
        );
    }

    #[test]
    fn test_canonical_event_shape() {
        let record = CanonicalRecord::event("u1", 1000, "_App Launched", Map::new()).unwrap();

        assert_eq!(record.kind(), RecordKind::Event);
        assert_eq!(record.name(), Some("_App Launched"));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"identity": "u1", "ts": 1000, "type": "event", "evtName": "_App Launched", "evtData": {}})
        );
    }

    #[test]
    fn test_canonical_construction_rejects_bad_records() {
        assert!(CanonicalRecord::profile("", 0, Map::new()).is_none());

        let oversized: Map<String, Value> =
            (0..=MAX_PROPERTIES).map(|i| (format!("k{}", i), json!(i))).collect();
        assert!(CanonicalRecord::event("u1", 0, "E", oversized).is_none());
    }
}
