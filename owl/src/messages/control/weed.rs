use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::time::Duration;

/// Weed message generated by the detection pipeline.
#[serde_as]
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct WeedMessage {
    /// Nozzle channel to actuate.
    pub channel: u8,
    /// When the weed was detected.
    pub timestamp: DateTime<Utc>,
    /// Time from detection until the nozzle is over the weed, in seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub delay: Duration,
    /// Time to hold the nozzle open, in seconds.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
}

#[cfg(test)]
mod tests {

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        r#"{"channel": 0, "timestamp": "2023-03-01T10:00:00Z",
        "delay": 0.0, "duration": 0.15}"#
    )]
    #[case(
        r#"{"channel": 7,
        "timestamp": "2023-03-01T10:00:00.250+00:00",
               "delay": 0.35, "duration": 1}"#
    )]
    #[case(
        r#"{"channel": 3, "timestamp": "2023-03-01T20:00:00+10:00",
                   "delay": 1.5, "duration": 0.05}"#
    )]
    fn test_parse_weed_message(#[case] raw_string: &str) {
        let _parsed: WeedMessage = serde_json::from_str(raw_string).unwrap();
    }

    #[rstest]
    #[case((
        r#"{"channel": 2, "timestamp": "2023-03-01T10:00:00Z",
               "delay": 0.1, "duration": 1.0}"#
    , WeedMessage {
            channel: 2,
            timestamp: "2023-03-01T10:00:00Z".parse().unwrap(),
            delay: Duration::from_millis(100),
            duration: Duration::from_secs(1),
        }))]
    #[case((
        r#"{"channel": 5, "timestamp": "2023-03-01T20:00:00+10:00",
               "delay": 0, "duration": 0.25}"#
    , WeedMessage {
            channel: 5,
            timestamp: "2023-03-01T10:00:00Z".parse().unwrap(),
            delay: Duration::ZERO,
            duration: Duration::from_millis(250),
        }))]
    fn test_parse_and_compare_weed_message(#[case] args: (&str, WeedMessage)) {
        let parsed: WeedMessage = serde_json::from_str(args.0).unwrap();

        assert_eq!(parsed, args.1, "Failed to parse message correctly");
    }

    #[rstest]
    #[case(r#"{"channel": 300, "timestamp": "2023-03-01T10:00:00Z", "delay": 0, "duration": 1}"#)]
    #[case(r#"{"channel": 1, "timestamp": "yesterday", "delay": 0, "duration": 1}"#)]
    #[case(r#"{"channel": 1, "timestamp": "2023-03-01T10:00:00Z", "delay": -1, "duration": 1}"#)]
    fn test_reject_malformed_weed_message(#[case] raw_string: &str) {
        assert!(serde_json::from_str::<WeedMessage>(raw_string).is_err());
    }
}
