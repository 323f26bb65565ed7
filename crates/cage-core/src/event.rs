use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One captured API call, as emitted by an installed hook. Records are
/// append-only: once written to the event log they are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent {
    /// Arrival order within the run.
    pub seq: u64,
    pub category: String,
    pub class: String,
    pub method: String,
    /// Capture-label to captured value, everything the hook recorded
    /// beyond the fixed identity fields.
    #[serde(default)]
    pub captures: BTreeMap<String, Value>,
}

impl ApiEvent {
    /// Build a record from the JSON object an interception block sends.
    /// The fixed fields are lifted out; every other key is a capture.
    pub fn from_payload(seq: u64, payload: &Value) -> Self {
        let mut category = String::new();
        let mut class = String::new();
        let mut method = String::new();
        let mut captures = BTreeMap::new();

        if let Some(object) = payload.as_object() {
            for (key, value) in object {
                match key.as_str() {
                    "Category" => category = value.as_str().unwrap_or_default().to_string(),
                    "Class" => class = value.as_str().unwrap_or_default().to_string(),
                    "Method" => method = value.as_str().unwrap_or_default().to_string(),
                    _ => {
                        captures.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Self {
            seq,
            category,
            class,
            method,
            captures,
        }
    }
}

/// What the scripting bridge delivers while a script is loaded: captured
/// events on the send channel, hook failures on the error channel.
#[derive(Debug, Clone)]
pub enum ScriptMessage {
    Event(Value),
    Error {
        description: String,
        stack: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_fields_split_into_identity_and_captures() {
        let payload = json!({
            "Category": "fingerprinting",
            "Class": "android.telephony.TelephonyManager",
            "Method": "getDeviceId",
            "Target file": "/data/data/com.example/shared_prefs/p.xml",
        });

        let event = ApiEvent::from_payload(7, &payload);
        assert_eq!(event.seq, 7);
        assert_eq!(event.category, "fingerprinting");
        assert_eq!(event.class, "android.telephony.TelephonyManager");
        assert_eq!(event.method, "getDeviceId");
        assert_eq!(
            event.captures.get("Target file").and_then(Value::as_str),
            Some("/data/data/com.example/shared_prefs/p.xml")
        );
        assert!(!event.captures.contains_key("Category"));
    }

    #[test]
    fn non_object_payload_yields_empty_record() {
        let event = ApiEvent::from_payload(0, &json!("not an object"));
        assert_eq!(event.category, "");
        assert!(event.captures.is_empty());
    }
}
