use serde::{Deserialize, Serialize};

/// Acknowledgement returned by notification endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
}

impl AckResponse {
    pub fn accepted() -> Self {
        AckResponse {
            status: "accepted".to_string(),
        }
    }
}

/// Error body returned by the RPC layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
