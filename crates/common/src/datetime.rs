use chrono::{NaiveDateTime, Timelike};

/// Datetime format the meters put on the wire: `DD-MM-YYYY HH:MM:SS`.
/// No timezone — values are stored and compared exactly as reported.
pub const WIRE_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Parse a wire datetime string.
pub fn parse_wire(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, WIRE_FORMAT)
}

/// Floor to the start of the minute.
pub fn floor_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

/// Floor to the start of the hour.
pub fn floor_hour(dt: NaiveDateTime) -> NaiveDateTime {
    floor_minute(dt).with_minute(0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_format() {
        let dt = parse_wire("01-01-2024 10:00:10").unwrap();
        assert_eq!(dt.to_string(), "2024-01-01 10:00:10");
    }

    #[test]
    fn rejects_iso_format() {
        assert!(parse_wire("2024-01-01 10:00:10").is_err());
        assert!(parse_wire("01-01-2024").is_err());
        assert!(parse_wire("").is_err());
    }

    #[test]
    fn floors_to_minute_and_hour() {
        let dt = parse_wire("15-06-2024 13:45:59").unwrap();
        assert_eq!(floor_minute(dt).to_string(), "2024-06-15 13:45:00");
        assert_eq!(floor_hour(dt).to_string(), "2024-06-15 13:00:00");
    }

    #[test]
    fn floor_is_idempotent() {
        let dt = parse_wire("15-06-2024 13:00:00").unwrap();
        assert_eq!(floor_minute(dt), dt);
        assert_eq!(floor_hour(dt), dt);
    }
}
