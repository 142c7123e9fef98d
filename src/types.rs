//! Wire types shared between the bridge and its upstream GraphQL endpoint

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// GraphQL request posted to the upstream endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// GraphQL document text
    pub query: String,

    /// Operation name (optional)
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// Variables for the operation
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// GraphQL response from the upstream endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// Response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Errors if any
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// Create a successful response
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }
}

/// A single GraphQL error as returned by the upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl GraphQLError {
    /// The `extensions.code` value, when the upstream attached one.
    pub fn code(&self) -> Option<&str> {
        self.extensions.get("code").and_then(|v| v.as_str())
    }
}

/// Connect protocol error body: `{code, message, details?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectError {
    pub code: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<serde_json::Value>,
}

impl ConnectError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_camel_case_operation_name() {
        let request = GraphQLRequest {
            query: "query Q { x }".into(),
            operation_name: Some("Q".into()),
            variables: serde_json::Map::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["operationName"], "Q");
        assert!(json.get("variables").is_none());
    }

    #[test]
    fn response_tolerates_extra_error_fields() {
        let response: GraphQLResponse = serde_json::from_str(
            r#"{"errors":[{"message":"boom","path":["a"],"extensions":{"code":"NOT_FOUND"}}]}"#,
        )
        .unwrap();
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].code(), Some("NOT_FOUND"));
        assert!(response.data.is_none());
    }
}
