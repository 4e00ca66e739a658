use serde::{Deserialize, Serialize};

/// Error body published on a `.../rejected` reply topic.
///
/// Fleet provisioning rejections use `statusCode`/`errorCode`/`errorMessage`;
/// shadow rejections use `code`/`message`, accepted here as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(alias = "code")]
    pub status_code: u16,
    #[serde(default)]
    pub error_code: String,
    #[serde(alias = "message")]
    pub error_message: String,
}

impl ErrorResponse {
    /// Parse a rejection body, returning `None` when it does not have the
    /// structured error shape.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}
