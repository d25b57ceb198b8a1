//! Wire types of the manager/worker protocol.
//!
//! Every operation is a JSON `POST` under the manager's route prefix. Field
//! names follow the camelCase layout existing indexer clients already send.

use serde::{Deserialize, Serialize};

pub const DEQUEUE_ROUTE: &str = "/dequeue";
pub const SET_LOG_ROUTE: &str = "/setlog";
pub const COMPLETE_ROUTE: &str = "/complete";
pub const HEARTBEAT_ROUTE: &str = "/heartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub indexer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLogRequest {
    pub indexer_name: String,
    pub index_id: i64,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub indexer_name: String,
    pub index_id: i64,
    /// Absent or empty marks the job as successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub indexer_name: String,
    #[serde(default)]
    pub index_ids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_request_omits_missing_error() {
        let body = serde_json::to_value(CompleteRequest {
            indexer_name: "w1".to_string(),
            index_id: 4,
            error_message: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"indexerName": "w1", "indexId": 4}));
    }

    #[test]
    fn heartbeat_ids_default_to_empty() {
        let req: HeartbeatRequest = serde_json::from_str(r#"{"indexerName": "w1"}"#).unwrap();
        assert!(req.index_ids.is_empty());
    }
}
