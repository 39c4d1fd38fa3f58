/// Standardise how messages are sent into the current
/// control system. Provide test suite to ensure
/// interfaces are respected.
pub mod control {
    use serde::Deserialize;

    /// Weed messages come from the detection pipeline. They
    /// specify the nozzle channel and timing characteristics
    /// for when a relay should fire.
    pub mod weed;
    /// Status messages toggle the detection and recording
    /// flags shown on the status indicator.
    pub mod status;

    /// Any message accepted on the control input.
    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(untagged)]
    pub enum ControlMessage {
        Weed(weed::WeedMessage),
        Status(status::StatusMessage),
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use rstest::rstest;

        #[rstest]
        #[case(r#"{"channel": 3, "timestamp": "2023-03-01T10:00:00Z", "delay": 0.1, "duration": 0.25}"#, true)]
        #[case(r#"{"capability": "detection", "enabled": true}"#, false)]
        #[case(r#"{"capability": "recording", "enabled": false}"#, false)]
        fn test_parse_control_message(#[case] raw_string: &str, #[case] is_weed: bool) {
            let parsed: ControlMessage = serde_json::from_str(raw_string).unwrap();
            assert_eq!(matches!(parsed, ControlMessage::Weed(_)), is_weed);
        }

        #[test]
        fn test_reject_unknown_message() {
            assert!(serde_json::from_str::<ControlMessage>(r#"{"channels": [1], "is_on": true}"#).is_err());
        }
    }
}
