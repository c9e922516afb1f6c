//! Host/worker message protocol.
//!
//! Every interaction between the supervisor and a worker is an [`Envelope`]:
//! a `{type, id, payload}` record made of plain serde values -- no function
//! values, no host object references.  The protocol is a small state machine:
//!
//! ```text
//! worker: ready ─┬─> response / error   (correlated by call id, repeatable)
//!                ├─> console            (any time, uncorrelated)
//!                └─> error(init | uncaught | unhandled-rejection)
//! host:   call ──┘   shutdown           (terminal)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SandboxError};

// ---------------------------------------------------------------------------
// Sentinel ids
// ---------------------------------------------------------------------------

/// Id carried by the `ready` envelope.
pub const READY_ID: &str = "ready";
/// Id carried by every `console` envelope.
pub const CONSOLE_ID: &str = "console";
/// Id carried by the `shutdown` envelope.
pub const SHUTDOWN_ID: &str = "shutdown";
/// Error id for failures while loading the plugin.
pub const INIT_ERROR_ID: &str = "init";
/// Error id for session-fatal faults with no correlating call.
pub const UNCAUGHT_ERROR_ID: &str = "uncaught";
/// Error id for non-fatal asynchronous faults.
pub const UNHANDLED_REJECTION_ID: &str = "unhandled-rejection";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Closed set of envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ready,
    Error,
    Call,
    Response,
    Console,
    Shutdown,
}

/// A structurally typed message crossing the trust boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    fn with_payload<P: Serialize>(kind: MessageType, id: impl Into<String>, payload: &P) -> Self {
        // Payload types in this module contain only strings, numbers and
        // `serde_json::Value`s, which always serialize.
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self {
            kind,
            id: id.into(),
            payload,
        }
    }

    pub fn ready(exports: Vec<String>) -> Self {
        Self::with_payload(MessageType::Ready, READY_ID, &ReadyPayload { exports })
    }

    pub fn call(id: impl Into<String>, method: &str, args: Vec<Value>, timeout_ms: u64) -> Self {
        Self::with_payload(
            MessageType::Call,
            id,
            &CallPayload {
                method: method.to_owned(),
                args,
                timeout_ms,
            },
        )
    }

    pub fn response(id: impl Into<String>, result: Value) -> Self {
        Self::with_payload(MessageType::Response, id, &ResponsePayload { result })
    }

    pub fn error(id: impl Into<String>, payload: ErrorPayload) -> Self {
        Self::with_payload(MessageType::Error, id, &payload)
    }

    pub fn console(level: LogLevel, args: Vec<Value>) -> Self {
        Self::with_payload(MessageType::Console, CONSOLE_ID, &ConsolePayload { level, args })
    }

    pub fn shutdown() -> Self {
        Self {
            kind: MessageType::Shutdown,
            id: SHUTDOWN_ID.to_owned(),
            payload: Value::Object(Default::default()),
        }
    }

    /// Decode the payload into its typed form.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SandboxError::Protocol(format!("malformed {:?} payload: {e}", self.kind))
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    /// Methods the plugin instance can be called with.
    pub exports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub result: Value,
}

/// Classification of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Initialization,
    MethodNotFound,
    Timeout,
    InvalidArguments,
    Execution,
    Uncaught,
    UnhandledRejection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    /// Convert a per-call error payload into the error handed to the caller.
    pub fn into_call_error(self, method: &str, timeout_ms: u64) -> SandboxError {
        match self.kind {
            ErrorKind::MethodNotFound => SandboxError::MethodNotFound {
                method: method.to_owned(),
            },
            ErrorKind::Timeout => SandboxError::ExecutionTimeout { timeout_ms },
            ErrorKind::InvalidArguments => SandboxError::InvalidArguments {
                method: method.to_owned(),
                reason: self.message,
            },
            ErrorKind::Initialization => SandboxError::Initialization {
                message: self.message,
                stack: self.stack,
            },
            ErrorKind::Uncaught => SandboxError::UncaughtPlugin {
                message: self.message,
                stack: self.stack,
            },
            ErrorKind::UnhandledRejection => SandboxError::UnhandledRejection {
                message: self.message,
            },
            ErrorKind::Execution => SandboxError::Execution {
                message: self.message,
                stack: self.stack,
            },
        }
    }
}

/// Severity of a plugin log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Map the guest's integer level (0 = error .. 4 = trace).
    pub fn from_guest(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::Error,
            1 => Self::Warn,
            2 => Self::Info,
            3 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolePayload {
    pub level: LogLevel,
    pub args: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn call_envelope_wire_shape() {
        let env = Envelope::call("c-1", "add", vec![json!(2), json!(3)], 500);
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "call",
                "id": "c-1",
                "payload": {"method": "add", "args": [2, 3], "timeout_ms": 500}
            })
        );
    }

    #[test]
    fn error_envelope_omits_missing_stack() {
        let env = Envelope::error(
            INIT_ERROR_ID,
            ErrorPayload::new(ErrorKind::Initialization, "boom"),
        );
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "error");
        assert_eq!(wire["id"], "init");
        assert!(wire["payload"].get("stack").is_none());
    }

    #[test]
    fn decode_typed_payload() {
        let env = Envelope::console(LogLevel::Warn, vec![json!("careful")]);
        let payload: ConsolePayload = env.decode().unwrap();
        assert_eq!(payload.level, LogLevel::Warn);
        assert_eq!(payload.args, vec![json!("careful")]);
    }

    #[test]
    fn decode_malformed_payload_is_protocol_error() {
        let env = Envelope {
            kind: MessageType::Response,
            id: "x".into(),
            payload: json!("not an object"),
        };
        let err = env.decode::<CallPayload>().unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(_)));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let raw = json!({"type": "eval", "id": "1", "payload": {}});
        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }

    #[test]
    fn guest_levels_map_onto_log_levels() {
        assert_eq!(LogLevel::from_guest(-3), LogLevel::Error);
        assert_eq!(LogLevel::from_guest(0), LogLevel::Error);
        assert_eq!(LogLevel::from_guest(2), LogLevel::Info);
        assert_eq!(LogLevel::from_guest(99), LogLevel::Trace);
    }

    #[test]
    fn error_payload_maps_to_call_errors() {
        let err = ErrorPayload::new(ErrorKind::MethodNotFound, "nope").into_call_error("m", 10);
        assert!(matches!(err, SandboxError::MethodNotFound { method } if method == "m"));

        let err = ErrorPayload::new(ErrorKind::Timeout, "slow").into_call_error("m", 10);
        assert!(matches!(err, SandboxError::ExecutionTimeout { timeout_ms: 10 }));

        let err = ErrorPayload::new(ErrorKind::Execution, "trap")
            .with_stack(Some("0: func[1]".into()))
            .into_call_error("m", 10);
        assert!(matches!(err, SandboxError::Execution { stack: Some(_), .. }));
    }
}
