//! `hp_hyprtavern_kv_store_v1` and `hp_hyprtavern_barmaid_v1` messages.

use serde::{Deserialize, Serialize};

use super::ValueType;

/// Why a `get_value` produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueError {
    /// No entry under that key in the selected namespace.
    ValueMissing,
}

/// Client → barmaid key-value requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvRequest {
    /// Store a value. An empty value is stored as-is; there is no delete.
    SetValue {
        /// Key.
        key: String,
        /// Value.
        value: String,
        /// Namespace.
        value_type: ValueType,
    },
    /// Fetch a value.
    GetValue {
        /// Key.
        key: String,
        /// Namespace.
        value_type: ValueType,
    },
}

/// Barmaid → client key-value events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum KvEvent {
    /// A present value.
    ValueObtained {
        /// Key echoed back.
        key: String,
        /// Stored value.
        value: String,
        /// Namespace echoed back.
        value_type: ValueType,
    },
    /// A missing value.
    ValueFailed {
        /// Key echoed back.
        key: String,
        /// Namespace echoed back.
        value_type: ValueType,
        /// Failure class.
        error: ValueError,
    },
    /// Structured error, e.g. a refused TAVERN operation.
    Error {
        /// Error code; `-1` for permission failures.
        code: i32,
        /// Human-readable detail.
        message: String,
    },
}

/// Client → barmaid lifecycle requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BarmaidRequest {
    /// Forwarded tavern environment; delivery doubles as the `env_update`
    /// notification that can wake an `UNAVAILABLE` store.
    UpdateEnvironment {
        /// Variable names.
        names: Vec<String>,
        /// Variable values, parallel to `names`.
        values: Vec<String>,
    },
}

/// Barmaid → client lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum BarmaidEvent {
    /// The store is open and serving.
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ValueType;

    #[test]
    fn kv_event_roundtrips() {
        let ev = KvEvent::ValueFailed {
            key: "core:security_token".into(),
            value_type: ValueType::App,
            error: ValueError::ValueMissing,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: KvEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
