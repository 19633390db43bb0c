use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Reserved key of the aggregate entry inside the devices map
pub const TOTAL_KEY: &str = "_TOTAL";

/// Normalized snapshot of one telemetry frame.
///
/// Numeric fields are always finite; anything that fails to coerce is stored as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub meter_id: Option<String>,
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    #[serde(rename = "energyKWh")]
    pub energy_kwh: f64,
    pub devices: BTreeMap<String, Value>,
    pub raw: Value,
}

impl Reading {
    /// The `_TOTAL` aggregate entry, if the frame carried one
    pub fn total(&self) -> Option<&Value> {
        self.devices.get(TOTAL_KEY)
    }

    /// Per-device entries, without the aggregate
    pub fn device_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.devices.iter().filter(|(id, _)| id.as_str() != TOTAL_KEY)
    }
}

/// Map an inbound telemetry payload onto a [`Reading`].
///
/// Accepts both `{ ...telemetry }` and `{ data: { ...telemetry } }`, snake_case
/// and camelCase keys. Top-level power/voltage/current fall back to the
/// `_TOTAL` device entry when missing or zero. Returns `None` for `null`.
pub fn normalize(raw: &Value) -> Option<Reading> {
    if raw.is_null() {
        return None;
    }

    let empty = Map::new();
    let envelope = raw.as_object().unwrap_or(&empty);
    let src = match envelope.get("data") {
        Some(data) if is_truthy(data) => data.as_object().unwrap_or(&empty),
        _ => envelope,
    };

    let devices: BTreeMap<String, Value> = match src.get("devices") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BTreeMap::new(),
    };

    let total = match devices.get(TOTAL_KEY) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let meter_id = lookup(src, &["meter_id", "meterId"])
        .or_else(|| lookup(envelope, &["meter_id", "meterId"]))
        .and_then(text_of);

    let number = |keys: &[&str]| {
        let value = lookup(src, keys).or_else(|| lookup(&total, keys));
        value.map(coerce_number).map(finite_or_zero).unwrap_or(0.0)
    };

    Some(Reading {
        meter_id,
        power_w: number(&["power_w", "powerW"]),
        voltage_v: number(&["voltage_v", "voltageV"]),
        current_a: number(&["current_a", "currentA"]),
        energy_kwh: lookup(&total, &["energy_kwh_total", "energyKwhTotal"])
            .map(coerce_number)
            .map(finite_or_zero)
            .unwrap_or(0.0),
        devices,
        raw: raw.clone(),
    })
}

/// First truthy value among the candidate keys.
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| is_truthy(value))
}

/// Absent-equivalents upstream: null, false, 0, NaN and "".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce a JSON value to a number; NaN when it has no numeric reading.
pub(crate) fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => coerce_text(s),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null => 0.0,
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Trimmed numeric text; empty text counts as 0, anything unparseable is NaN.
pub(crate) fn coerce_text(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        0.0
    } else {
        trimmed.parse::<f64>().unwrap_or(f64::NAN)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_null_is_not_a_reading() {
        assert_eq!(normalize(&Value::Null), None);
    }

    #[test]
    fn test_wrapped_payload_with_total_fallback() {
        let raw = json!({ "data": { "meter_id": "M1", "devices": { "_TOTAL": { "power_w": "12.5" } } } });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.meter_id.as_deref(), Some("M1"));
        assert_eq!(reading.power_w, 12.5);
        assert_eq!(reading.voltage_v, 0.0);
        assert_eq!(reading.current_a, 0.0);
        assert_eq!(reading.energy_kwh, 0.0);
        assert_eq!(reading.raw, raw);
        assert!(reading.total().is_some());
    }

    #[test]
    fn test_unwrapped_payload_prefers_top_level_fields() {
        let raw = json!({
            "meter_id": "METER001",
            "power_w": 1520.4,
            "voltage_v": 230.1,
            "current_a": "6.61",
            "devices": {
                "FRIDGE": { "power_w": 90.0, "on": true },
                "_TOTAL": { "power_w": 1.0, "voltage_v": 2.0, "current_a": 3.0, "energy_kwh_total": 4.25 }
            }
        });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.power_w, 1520.4);
        assert_eq!(reading.voltage_v, 230.1);
        assert_eq!(reading.current_a, 6.61);
        assert_eq!(reading.energy_kwh, 4.25);
        assert_eq!(reading.device_entries().count(), 1);
        assert_eq!(reading.devices.len(), 2);
    }

    #[test]
    fn test_zero_top_level_falls_back_to_total() {
        let raw = json!({ "power_w": 0, "devices": { "_TOTAL": { "power_w": 88 } } });
        assert_eq!(normalize(&raw).unwrap().power_w, 88.0);
    }

    #[test]
    fn test_camel_case_fields() {
        let raw = json!({
            "meterId": "M9",
            "powerW": 10,
            "voltageV": "220",
            "currentA": 0.5,
            "devices": { "_TOTAL": { "energyKwhTotal": 1.5 } }
        });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.meter_id.as_deref(), Some("M9"));
        assert_eq!(reading.power_w, 10.0);
        assert_eq!(reading.voltage_v, 220.0);
        assert_eq!(reading.current_a, 0.5);
        assert_eq!(reading.energy_kwh, 1.5);
    }

    #[test]
    fn test_unparseable_numbers_become_zero() {
        let raw = json!({ "power_w": "abc", "voltage_v": [1, 2], "current_a": { "x": 1 } });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.power_w, 0.0);
        assert_eq!(reading.voltage_v, 0.0);
        assert_eq!(reading.current_a, 0.0);
        assert!(reading.meter_id.is_none());
        assert!(reading.devices.is_empty());
    }

    #[test]
    fn test_non_finite_strings_become_zero() {
        let raw = json!({ "power_w": "inf", "devices": { "_TOTAL": { "energy_kwh_total": "NaN" } } });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.power_w, 0.0);
        assert_eq!(reading.energy_kwh, 0.0);
    }

    #[test]
    fn test_meter_id_from_envelope_and_numbers() {
        let raw = json!({ "meter_id": 7, "data": { "power_w": 5 } });
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.meter_id.as_deref(), Some("7"));
        assert_eq!(reading.power_w, 5.0);
    }

    #[test]
    fn test_non_object_payload_is_zero_reading() {
        let raw = json!(42);
        let reading = normalize(&raw).unwrap();

        assert_eq!(reading.power_w, 0.0);
        assert_eq!(reading.raw, raw);
    }

    #[test]
    fn test_reading_serializes_camel_case() {
        let reading = normalize(&json!({ "meter_id": "M1", "power_w": 1 })).unwrap();
        let json = serde_json::to_value(&reading).unwrap();

        assert_eq!(json["meterId"], "M1");
        assert_eq!(json["powerW"], 1.0);
        assert_eq!(json["energyKWh"], 0.0);
    }

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!(" 3.5 ")), 3.5);
        assert_eq!(coerce_number(&json!("")), 0.0);
        assert_eq!(coerce_number(&json!(true)), 1.0);
        assert_eq!(coerce_number(&Value::Null), 0.0);
        assert!(coerce_number(&json!("abc")).is_nan());
    }
}
