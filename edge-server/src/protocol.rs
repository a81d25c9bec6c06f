//! Validation of client frames into typed worker commands.

use robolink_model::{Command, ErrorCode};
use serde_json::{Map, Value};

#[derive(Debug)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Validate a decrypted `(event, payload)` pair into a [`Command`].
pub fn validate_command(event: &str, payload: Map<String, Value>) -> Result<Command, ProtocolError> {
    match event {
        "" => Err(ProtocolError::new(
            ErrorCode::ProtocolMissingField,
            "missing `event` field",
        )),
        "update" => validate_update(payload),
        "start" => Ok(Command::Start),
        "process" => validate_process(payload),
        other => Err(ProtocolError::new(
            ErrorCode::ProtocolUnknownCommand,
            format!("unknown command: {other}"),
        )),
    }
}

fn validate_update(payload: Map<String, Value>) -> Result<Command, ProtocolError> {
    match payload.get("data") {
        Some(Value::String(archive)) => Ok(Command::Update {
            archive: archive.clone(),
        }),
        Some(_) => Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            "`data` must be a base64 string",
        )),
        None => Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            "update requires a `data` field",
        )),
    }
}

fn validate_process(payload: Map<String, Value>) -> Result<Command, ProtocolError> {
    let Some(params) = payload.get("params") else {
        return Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            "process requires a `params` field",
        ));
    };
    let Some(params) = params.as_object() else {
        return Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            "`params` must be an object",
        ));
    };

    let object = require_string(params, "object")?;
    let method = require_string(params, "method")?;

    let args = match params.get("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(args)) => args.clone(),
        Some(_) => {
            return Err(ProtocolError::new(
                ErrorCode::ProtocolInvalidParams,
                "`args` must be an object",
            ));
        }
    };

    Ok(Command::Process {
        object,
        method,
        args,
    })
}

fn require_string(params: &Map<String, Value>, field: &str) -> Result<String, ProtocolError> {
    match params.get(field) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value.clone()),
        Some(_) => Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            format!("`{field}` must be a non-empty string"),
        )),
        None => Err(ProtocolError::new(
            ErrorCode::ProtocolInvalidParams,
            format!("`params` must contain `{field}`"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn update_requires_a_base64_string() {
        let command = validate_command("update", object(json!({"data": "AAAA"}))).unwrap();
        assert_eq!(
            command,
            Command::Update {
                archive: "AAAA".to_owned()
            }
        );

        let err = validate_command("update", object(json!({}))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolInvalidParams);

        let err = validate_command("update", object(json!({"data": 42}))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolInvalidParams);
    }

    #[test]
    fn start_takes_no_extra_fields() {
        let command = validate_command("start", Map::new()).unwrap();
        assert_eq!(command, Command::Start);
    }

    #[test]
    fn process_validates_params_shape() {
        let command = validate_command(
            "process",
            object(json!({"params": {"object": "c", "method": "greet"}})),
        )
        .unwrap();
        let Command::Process { object: target, method, args } = command else {
            panic!("expected process");
        };
        assert_eq!(target, "c");
        assert_eq!(method, "greet");
        assert!(args.is_empty());

        for bad in [
            json!({}),
            json!({"params": "not-an-object"}),
            json!({"params": {"method": "greet"}}),
            json!({"params": {"object": "c"}}),
            json!({"params": {"object": "c", "method": "greet", "args": [1, 2]}}),
        ] {
            let err = validate_command("process", object(bad)).unwrap_err();
            assert_eq!(err.code, ErrorCode::ProtocolInvalidParams);
        }
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let err = validate_command("reboot", Map::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolUnknownCommand);

        // The disconnect notification is internal; clients can't send it.
        let err = validate_command("client_disconnected", Map::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolUnknownCommand);
    }
}
