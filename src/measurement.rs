//! Measured quantities supplied by the clinical data layer

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A numeric value paired with its unit of record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    #[serde(rename = "unit")]
    pub unit_code: String,
}

impl Measurement {
    pub fn new(value: f64, unit_code: impl Into<String>) -> Self {
        Self {
            value,
            unit_code: unit_code.into(),
        }
    }

    /// Build a measurement from optional parts.
    /// A measurement missing either its value or its unit is treated as absent.
    pub fn from_parts(value: Option<f64>, unit_code: Option<String>) -> Option<Self> {
        match (value, unit_code) {
            (Some(value), Some(unit_code)) => Some(Self { value, unit_code }),
            (None, _) => {
                warn!("Measurement has no value set");
                None
            }
            (_, None) => {
                warn!("Measurement has no unit set");
                None
            }
        }
    }

    /// Extract the quantity from a FHIR Observation resource.
    ///
    /// Reads `valueQuantity.value` and the unit from `valueQuantity.code`,
    /// falling back to `valueQuantity.unit` when no code is present.
    pub fn from_fhir_observation(observation: &Value) -> Option<Self> {
        let id = observation
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>");

        let Some(quantity) = observation.get("valueQuantity") else {
            warn!("No valueQuantity set for observation with id :: {}", id);
            return None;
        };

        let value = quantity.get("value").and_then(Value::as_f64);
        let unit_code = quantity
            .get("code")
            .and_then(Value::as_str)
            .or_else(|| quantity.get("unit").and_then(Value::as_str))
            .map(str::to_string);

        Self::from_parts(value, unit_code)
    }

    /// Textual form of the value, always carrying a decimal point for finite
    /// values (`75.0`, not `75`) so that precision formatting applies uniformly.
    pub fn value_string(&self) -> String {
        render_value(self.value)
    }
}

/// Render a float the way it is shown before any precision is applied
pub fn render_value(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_parts() {
        let m = Measurement::from_parts(Some(3.7), Some("mmol/L".to_string())).unwrap();
        assert_eq!(m, Measurement::new(3.7, "mmol/L"));

        assert!(Measurement::from_parts(None, Some("mmol/L".to_string())).is_none());
        assert!(Measurement::from_parts(Some(3.7), None).is_none());
    }

    #[test]
    fn test_value_string() {
        assert_eq!(Measurement::new(75.0, "mg/dL").value_string(), "75.0");
        assert_eq!(Measurement::new(3.7, "mmol/L").value_string(), "3.7");
        assert_eq!(Measurement::new(-2.0, "Cel").value_string(), "-2.0");
        assert_eq!(render_value(f64::NAN), "NaN");
    }

    #[test]
    fn test_from_fhir_observation() {
        let obs = json!({
            "resourceType": "Observation",
            "id": "glucose-1",
            "valueQuantity": {
                "value": 3.7,
                "unit": "mmol/l",
                "system": "http://unitsofmeasure.org",
                "code": "mmol/L"
            }
        });
        let m = Measurement::from_fhir_observation(&obs).unwrap();
        assert_eq!(m.value, 3.7);
        assert_eq!(m.unit_code, "mmol/L");

        let unit_only = json!({ "valueQuantity": { "value": 75, "unit": "mg/dL" } });
        let m = Measurement::from_fhir_observation(&unit_only).unwrap();
        assert_eq!(m, Measurement::new(75.0, "mg/dL"));
    }

    #[test]
    fn test_incomplete_observation_is_absent() {
        let no_unit = json!({ "valueQuantity": { "value": 3.7 } });
        assert!(Measurement::from_fhir_observation(&no_unit).is_none());

        let no_quantity = json!({ "resourceType": "Observation" });
        assert!(Measurement::from_fhir_observation(&no_quantity).is_none());
    }
}
