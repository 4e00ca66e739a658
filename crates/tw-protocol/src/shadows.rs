use serde::{Deserialize, Serialize};

/// Request body for shadow get and delete: an empty JSON object.
pub const EMPTY_REQUEST: &[u8] = b"{}";

/// Reported-state update in the shape the shadow service expects:
/// `{"state": {"reported": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowUpdate {
    pub state: ReportedState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedState {
    pub reported: serde_json::Value,
}

impl ShadowUpdate {
    pub fn reported(reported: serde_json::Value) -> Self {
        Self {
            state: ReportedState { reported },
        }
    }
}
