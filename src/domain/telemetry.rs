// Telemetry data domain models
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single committed `(timestamp, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// State record as reported by the host platform, live or historical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    #[serde(default)]
    pub entity_id: Option<String>,
    pub state: String,
    pub last_changed: DateTime<Utc>,
    /// Advances on attribute-only updates too; absent in minimal payloads.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    /// Numeric reading of this record: the named attribute when one is given,
    /// otherwise the state string. Non-numeric and non-finite readings yield `None`.
    pub fn numeric_value(&self, attribute: Option<&str>) -> Option<f64> {
        match attribute {
            Some(name) => self.attributes.get(name).and_then(parse_numeric),
            None => parse_numeric_str(&self.state),
        }
    }

    /// When the reading was taken. `last_changed` only moves with the state
    /// string, so attribute readings use `last_updated`.
    pub fn observed_at(&self, attribute: Option<&str>) -> DateTime<Utc> {
        match attribute {
            Some(_) => self.last_updated.unwrap_or(self.last_changed),
            None => self.last_changed,
        }
    }

    pub fn timestamp_ms(&self, attribute: Option<&str>) -> i64 {
        self.observed_at(attribute).timestamp_millis()
    }
}

/// Raw state-change event from the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub new_state: EntityState,
}

impl StateChangedEvent {
    pub fn new(entity_id: impl Into<String>, new_state: EntityState) -> Self {
        Self {
            entity_id: entity_id.into(),
            new_state,
        }
    }
}

/// Latest known state of a tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub value: Option<f64>,
    pub state: Option<String>,
    pub attributes: Map<String, Value>,
    pub last_changed: Option<DateTime<Utc>>,
    pub timestamp: Option<i64>,
    pub sources: Vec<String>,
}

impl EntitySnapshot {
    pub fn empty(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            value: None,
            state: None,
            attributes: Map::new(),
            last_changed: None,
            timestamp: None,
            sources: Vec::new(),
        }
    }

    /// Record a committed sample along with the raw state it came from.
    pub fn record(&mut self, sample: Sample, raw: &EntityState) {
        self.value = Some(sample.value);
        self.timestamp = Some(sample.timestamp);
        self.state = Some(raw.state.clone());
        self.attributes = raw.attributes.clone();
        self.last_changed = Some(raw.last_changed);
    }
}

fn parse_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_numeric_str(s),
        _ => None,
    }
}

fn parse_numeric_str(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(raw: &str, attributes: Value) -> EntityState {
        EntityState {
            entity_id: None,
            state: raw.to_string(),
            last_changed: "2024-05-01T12:00:00Z".parse().unwrap(),
            last_updated: None,
            attributes: attributes.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_numeric_value_from_state() {
        assert_eq!(state(" 21.5 ", json!({})).numeric_value(None), Some(21.5));
        assert_eq!(state("unavailable", json!({})).numeric_value(None), None);
        assert_eq!(state("NaN", json!({})).numeric_value(None), None);
        assert_eq!(state("inf", json!({})).numeric_value(None), None);
    }

    #[test]
    fn test_numeric_value_from_attribute() {
        let s = state("heat", json!({ "current_temperature": 19.0, "target": "20.5", "mode": "auto" }));
        assert_eq!(s.numeric_value(Some("current_temperature")), Some(19.0));
        assert_eq!(s.numeric_value(Some("target")), Some(20.5));
        assert_eq!(s.numeric_value(Some("mode")), None);
        assert_eq!(s.numeric_value(Some("missing")), None);
    }

    #[test]
    fn test_event_deserializes_from_host_payload() {
        let payload = json!({
            "entity_id": "sensor.cpu_temperature",
            "new_state": {
                "entity_id": "sensor.cpu_temperature",
                "state": "72.3",
                "last_changed": "2024-05-01T12:00:00.250+00:00",
                "attributes": { "unit_of_measurement": "°C" }
            }
        });
        let event: StateChangedEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.entity_id, "sensor.cpu_temperature");
        assert_eq!(event.new_state.numeric_value(None), Some(72.3));
        assert_eq!(event.new_state.timestamp_ms(None) % 1000, 250);
        assert_eq!(event.new_state.last_updated, None);
    }

    #[test]
    fn test_attribute_readings_use_last_updated() {
        let payload = json!({
            "state": "heat",
            "last_changed": "2024-05-01T09:00:00+00:00",
            "last_updated": "2024-05-01T11:55:00+00:00",
            "attributes": { "current_temperature": 21.0 }
        });
        let record: EntityState = serde_json::from_value(payload).unwrap();
        let changed: DateTime<Utc> = "2024-05-01T09:00:00Z".parse().unwrap();
        let updated: DateTime<Utc> = "2024-05-01T11:55:00Z".parse().unwrap();

        assert_eq!(record.observed_at(None), changed);
        assert_eq!(record.observed_at(Some("current_temperature")), updated);
        assert_eq!(
            record.timestamp_ms(Some("current_temperature")),
            updated.timestamp_millis()
        );

        let minimal = state("heat", json!({ "current_temperature": 21.0 }));
        assert_eq!(minimal.observed_at(Some("current_temperature")), minimal.last_changed);
    }
}
