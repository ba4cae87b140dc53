//! JSON-RPC 2.0 messages.
//!
//! Domain failures use the implementation-defined range below -32000 and carry
//! the stable error identifier in `data.code`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::error::WipeError;

/// A call from a client such as `sanitd wipe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Dotted method name, e.g. `jobs.submit`
    pub method: String,
    /// Method parameters, normally an object
    #[serde(default)]
    pub params: Option<Value>,
    /// Correlates the response. Absent for notifications, which get no reply.
    #[serde(default)]
    pub id: Option<Value>,
}

/// Reply to a `Request`. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,
    /// Method output when the call succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details when the call did not succeed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Copied from the request, `null` if it could not be read
    pub id: Value,
}

/// Error member of a failed `Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Protocol code, or one of the domain codes below -32000
    pub code: i32,
    /// Human-readable description
    pub message: String,
    /// For domain errors, `{"code": <identifier>}` matching the HTTP error body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// The `data.code` identifier of a domain error, if any.
    pub fn domain_code(&self) -> Option<&str> {
        self.data.as_ref()?.get("code")?.as_str()
    }
}

// Protocol errors
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Domain errors
pub const NOT_FOUND: i32 = -32001;
pub const CONFLICT: i32 = -32002;
pub const REJECTED: i32 = -32003;
pub const HARDWARE_ERROR: i32 = -32004;
pub const LEDGER_INTEGRITY: i32 = -32005;
pub const STORAGE_ERROR: i32 = -32006;
pub const CONNECTION_LOST: i32 = -32007;

pub fn wipe_error_code(err: &WipeError) -> i32 {
    match err {
        WipeError::DeviceNotFound(_) | WipeError::JobNotFound(_) | WipeError::CertificateNotFound(_) => {
            NOT_FOUND
        }
        WipeError::DeviceBusy(_)
        | WipeError::InvalidDevice { .. }
        | WipeError::Cancelled { .. }
        | WipeError::DuplicateCertificate(_) => {
            CONFLICT
        }
        WipeError::DeviceNotWipeable(_)
        | WipeError::UnknownMethod { .. }
        | WipeError::EmptySelection
        | WipeError::CertificateRejected { .. } => {
            REJECTED
        }
        WipeError::HardwareIo { .. } => HARDWARE_ERROR,
        WipeError::ChainIntegrity { .. } => LEDGER_INTEGRITY,
        WipeError::Storage(_) => STORAGE_ERROR,
        WipeError::ConnectionLost(_) => CONNECTION_LOST,
    }
}

impl Response {
    pub fn success(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                jsonrpc: "2.0".to_string(),
                result: Some(value),
                error: None,
                id,
            },
            Err(e) => Self::internal_error(id, format!("Failed to encode result: {}", e)),
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::with_error(id, code, message.into(), None)
    }

    pub fn wipe_error(id: Value, err: &WipeError) -> Self {
        Self::with_error(
            id,
            wipe_error_code(err),
            err.to_string(),
            Some(json!({ "code": err.code() })),
        )
    }

    fn with_error(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError { code, message, data }),
            id,
        }
    }

    /// Used when the request id could not be read.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details.into())
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details.into())
    }
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != "2.0" {
            return Err("jsonrpc must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = r#"{"jsonrpc":"2.0","method":"jobs.submit","params":{"device_ids":["dev-1"]},"id":1}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "jobs.submit");
        assert_eq!(req.id, Some(Value::Number(1.into())));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_parse_notification() {
        let req: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"daemon.status"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn test_wrong_version_is_invalid() {
        let req: Request = serde_json::from_str(r#"{"jsonrpc":"1.0","method":"x","id":1}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_domain_error_carries_code() {
        let resp = Response::wipe_error(Value::from(7), &WipeError::DeviceBusy("dev-1".into()));
        let error = resp.error.unwrap();

        assert_eq!(error.code, CONFLICT);
        assert_eq!(error.domain_code(), Some("device_busy"));
        assert!(error.message.contains("dev-1"));
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_error_ranges() {
        assert_eq!(wipe_error_code(&WipeError::EmptySelection), REJECTED);
        assert_eq!(wipe_error_code(&WipeError::JobNotFound("j".into())), NOT_FOUND);
        assert_eq!(
            wipe_error_code(&WipeError::ChainIntegrity { index: 2, reason: "x".into() }),
            LEDGER_INTEGRITY
        );
    }

    #[test]
    fn test_serialize_success_response() {
        let json = serde_json::to_string(&Response::success(Value::from(1), "ok")).unwrap();
        assert!(json.contains(r#""result":"ok""#));
        assert!(!json.contains("error"));
    }
}
