use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job id that asks the jobs service for the next pending execution.
pub const NEXT_JOB: &str = "$next";

/// Job-get request body: `{"clientToken": ..., "jobId": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobGetRequest {
    pub client_token: String,
    pub job_id: String,
}

impl JobGetRequest {
    /// Request for the next pending job, with a fresh client token.
    pub fn next() -> Self {
        Self {
            client_token: Uuid::now_v7().to_string(),
            job_id: NEXT_JOB.to_string(),
        }
    }
}
