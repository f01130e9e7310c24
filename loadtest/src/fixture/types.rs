use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Success code of the collaborator's response envelope
pub const SUCCESS_CODE: i64 = 1000;

/// Fixture setup errors. All of them abort the run before any connection.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Login failed: {0}")]
    Auth(String),

    #[error("Failed to list targets: {0}")]
    Fetch(String),

    #[error("Failed to create target: {0}")]
    Create(String),

    #[error("No usable targets available")]
    NoTargets,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// `{"code": 1000, "message": ..., "data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    /// The payload, or the collaborator's message when the code is not a success
    pub fn into_data(self) -> Result<T, String> {
        if self.code != SUCCESS_CODE {
            return Err(format!("code {}: {}", self.code, self.message));
        }
        self.data
            .ok_or_else(|| format!("code {} without data", self.code))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginData {
    pub token: String,
}

/// A logical group agents connect to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Routing key sent on every connection and envelope
    #[serde(rename = "activation_code")]
    pub key: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub is_active: bool,
}

/// One page of the target listing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetPage {
    #[serde(default)]
    pub list: Vec<Target>,
    #[serde(default)]
    pub total: u64,
}

/// Body of a create call. The key is assigned by the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetSpec {
    pub remark: String,
    pub is_active: bool,
    pub user_id: u64,
}

impl TargetSpec {
    pub fn active(remark: impl Into<String>) -> Self {
        Self {
            remark: remark.into(),
            is_active: true,
            user_id: 1,
        }
    }
}
