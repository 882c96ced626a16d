use serde::{Deserialize, Serialize};

/// One raw measurement payload emitted by a meter.
///
/// `datetime` is kept as the wire string until the pipeline parses it, so a
/// malformed timestamp surfaces where the retry policy can act on it.
/// `energy` is the meter's cumulative kWh counter, non-decreasing by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub datetime: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub frequency: f64,
    pub pf: f64,
    /// Optional self-reported device code, checked against the topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// One line in a device's buffer file: the payload plus the identity the
/// worker resolved at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub username: String,
    pub device_code: String,
    pub device_id: i64,
    pub payload: Sample,
}

/// Arithmetic means of the five instantaneous fields over a bucket.
/// Energy is not averaged — it is tracked as first/last cumulative readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAverages {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub frequency: f64,
    pub pf: f64,
}

/// Round a kWh delta to meter resolution (three decimal places).
pub fn round_kwh(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_roundtrips_without_device_id() {
        let json = r#"{"datetime":"01-01-2024 10:00:10","voltage":220.0,"current":1.0,"power":220.0,"energy":100.0,"frequency":50.0,"pf":1.0}"#;
        let sample: Sample = serde_json::from_str(json).unwrap();
        assert!(sample.device_id.is_none());
        let back = serde_json::to_string(&sample).unwrap();
        assert!(!back.contains("device_id"));
    }

    #[test]
    fn rounds_to_milli_kwh() {
        assert_eq!(round_kwh(0.0124999), 0.012);
        assert_eq!(round_kwh(0.0125001), 0.013);
        assert_eq!(round_kwh(100.005 - 100.0), 0.005);
        assert_eq!(round_kwh(-0.0004), -0.0);
    }
}
