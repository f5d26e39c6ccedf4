//! Wire responses.
//!
//! A response carries a status code, the query's token, and zero or more
//! result rows, each serialized as a JSON string. Error responses carry a
//! message and, when the fault lies in the user's query, the descent
//! backtrace.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// A single JSON result row.
    SuccessJson,
    /// A stream result, complete in this response.
    SuccessStream,
    /// A stream batch; more rows are available via CONTINUE.
    SuccessPartial,
    /// No payload (STOP acknowledgement).
    SuccessEmpty,
    /// The wire message violated the schema.
    BrokenClient,
    BadQuery,
    RuntimeError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status_code: StatusCode,
    pub token: i64,
    /// Result rows, each a serialized JSON document.
    pub response: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

fn row(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

impl Response {
    pub fn json(token: i64, value: &Value) -> Self {
        Self {
            status_code: StatusCode::SuccessJson,
            token,
            response: vec![row(value)],
            error_message: None,
            backtrace: None,
        }
    }

    pub fn stream(token: i64, values: &[Value]) -> Self {
        Self {
            status_code: StatusCode::SuccessStream,
            token,
            response: values.iter().map(row).collect(),
            error_message: None,
            backtrace: None,
        }
    }

    pub fn partial(token: i64, values: &[Value]) -> Self {
        Self {
            status_code: StatusCode::SuccessPartial,
            token,
            response: values.iter().map(row).collect(),
            error_message: None,
            backtrace: None,
        }
    }

    pub fn empty(token: i64) -> Self {
        Self {
            status_code: StatusCode::SuccessEmpty,
            token,
            response: Vec::new(),
            error_message: None,
            backtrace: None,
        }
    }

    pub fn from_error(token: i64, err: &QlError) -> Self {
        let status_code = match err {
            QlError::BadProtobuf(_) => StatusCode::BrokenClient,
            QlError::BadQuery { .. } => StatusCode::BadQuery,
            QlError::Runtime { .. } => StatusCode::RuntimeError,
        };
        Self {
            status_code,
            token,
            response: Vec::new(),
            error_message: Some(err.to_string()),
            backtrace: err.backtrace().map(|bt| bt.frames().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtrace::Backtrace;
    use serde_json::json;

    #[test]
    fn test_json_response() {
        let r = Response::json(3, &json!({"a": 1}));
        assert_eq!(r.status_code, StatusCode::SuccessJson);
        assert_eq!(r.response, vec![r#"{"a":1}"#.to_string()]);
        assert!(r.error_message.is_none());
    }

    #[test]
    fn test_error_mapping() {
        let r = Response::from_error(1, &QlError::bad_protobuf("nope"));
        assert_eq!(r.status_code, StatusCode::BrokenClient);
        assert!(r.backtrace.is_none());

        let bt = Backtrace::new().descend("argument:1");
        let r = Response::from_error(1, &QlError::bad_query("bad", &bt));
        assert_eq!(r.status_code, StatusCode::BadQuery);
        assert_eq!(r.backtrace, Some(vec!["argument:1".to_string()]));

        let r = Response::from_error(1, &QlError::runtime("boom", &bt));
        assert_eq!(r.status_code, StatusCode::RuntimeError);
        assert_eq!(r.error_message.as_deref(), Some("runtime error: boom"));
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let r = Response::empty(9);
        let encoded = serde_json::to_string(&r).unwrap();
        assert!(!encoded.contains("error_message"));
        assert!(!encoded.contains("backtrace"));
    }
}
