use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ErrorCode;

/// A validated command travelling edge -> worker on the command channel.
///
/// Wire form is `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Upload a new project archive (base64 zip).
    Update { archive: String },
    /// Load the current project into the executor.
    Start,
    /// Invoke `object.method(**args)` against the loaded project.
    Process {
        object: String,
        method: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    /// The admitted client went away; stop user background activity.
    ClientDisconnected { session_id: String },
}

impl Command {
    /// The wire name of this command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Update { .. } => "update",
            Command::Start => "start",
            Command::Process { .. } => "process",
            Command::ClientDisconnected { .. } => "client_disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// The reply to a single [`Command`], returned verbatim to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Reply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            error_code: None,
            message: message.into(),
            data: None,
            result: None,
        }
    }

    pub fn success_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::success(message)
        }
    }

    /// A successful `process` invocation carrying the method's return value.
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::success("")
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            status: Status::Error,
            error_code: Some(code),
            message: code.default_message().to_owned(),
            data: None,
            result: None,
        }
    }

    pub fn error_with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::error(code)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Messages travelling worker -> edge on the callback channel.
///
/// Pushes carry a client-visible event name chosen by user code. Anything
/// else is forwarded to the client under the generic `callback` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CallbackMessage {
    Push(PushMessage),
    Other(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushMessage {
    #[serde(rename = "type")]
    tag: PushTag,
    pub event: String,
    pub data: Value,
}

impl PushMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            tag: PushTag::Push,
            event: event.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
enum PushTag {
    #[serde(rename = "push")]
    Push,
}
