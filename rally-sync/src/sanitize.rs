//! Outbound state sanitization.
//!
//! The remote store cannot hold the previous-snapshot back-reference the
//! scoreboard keeps for undo, so the transient `lastSnapshot` key is removed
//! from the top-level object before a snapshot leaves the device. Nested
//! values are kept as they are.
//!
//! Missing values need no separate pass: `Option::None` fields serialize as
//! `null`, and `serde_json` turns non-finite floats into `null` when a typed
//! state becomes a [`Value`], so a `Value` never holds anything else that JSON
//! cannot carry.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Top-level keys that only make sense on the host device.
pub const TRANSIENT_FIELDS: &[&str] = &["lastSnapshot"];

/// Sanitize an already-built JSON snapshot.
pub fn sanitize_state(state: &Value) -> Value {
    match state {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !TRANSIENT_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Serialize a typed state and sanitize it in one step.
pub fn sanitize<T: Serialize>(state: &T) -> Result<Value, StoreError> {
    let value = serde_json::to_value(state)?;
    Ok(sanitize_state(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Score {
        score_a: u32,
        serving: Option<String>,
        last_snapshot: Option<Box<Score>>,
    }

    #[test]
    fn test_strips_last_snapshot() {
        let state = json!({
            "scoreA": 10,
            "lastSnapshot": {"scoreA": 9},
        });
        let clean = sanitize_state(&state);
        assert_eq!(clean, json!({"scoreA": 10}));
    }

    #[test]
    fn test_nested_last_snapshot_is_kept() {
        // only the top-level back-reference is transient
        let state = json!({"history": [{"lastSnapshot": 1}]});
        assert_eq!(sanitize_state(&state), state);
    }

    #[test]
    fn test_none_becomes_null() {
        let score = Score {
            score_a: 3,
            serving: None,
            last_snapshot: Some(Box::new(Score {
                score_a: 2,
                serving: None,
                last_snapshot: None,
            })),
        };
        let clean = sanitize(&score).unwrap();
        assert_eq!(clean, json!({"scoreA": 3, "serving": null}));
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        #[derive(Serialize)]
        struct Timing {
            ratio: f64,
            rally: u32,
        }
        let clean = sanitize(&Timing {
            ratio: f64::NAN,
            rally: 4,
        })
        .unwrap();
        assert_eq!(clean, json!({"ratio": null, "rally": 4}));
    }

    #[test]
    fn test_non_object_passthrough() {
        assert_eq!(sanitize_state(&json!([1, "x", null])), json!([1, "x", null]));
        assert_eq!(sanitize_state(&Value::Null), Value::Null);
    }

    #[test]
    fn test_deeply_nested_values_preserved() {
        let state = json!({
            "sets": [{"a": 25, "b": 23}, {"a": 20, "b": 25}],
            "teams": {"A": {"players": ["x", "y"], "libero": null}},
        });
        assert_eq!(sanitize_state(&state), state);
    }
}
