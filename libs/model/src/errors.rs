use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable error identities shared by all gateway processes.
///
/// Codes are five digits: a two-digit band plus a three-digit ordinal.
/// `00xxx` connection/auth, `01xxx` protocol, `02xxx` project/security,
/// `03xxx` execution, `99xxx` internal. The code never changes for a
/// given failure; handlers may override the human message only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionRejected,
    ConnectionLimitReached,
    AuthTokenMissing,
    AuthTokenInvalid,
    AuthTokenExpired,

    ProtocolInvalidFormat,
    ProtocolMissingField,
    ProtocolUnknownCommand,
    ProtocolInvalidParams,

    ProjectUploadFailed,
    ProjectInvalidFormat,
    ProjectLoadFailed,
    ProjectNotFound,
    ProjectSecurityViolation,

    ExecutionFailed,
    MethodNotFound,
    ObjectNotFound,
    ModuleLoadError,

    InternalError,
    UnknownError,
}

impl ErrorCode {
    pub const fn code(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionRejected => "00001",
            ErrorCode::ConnectionLimitReached => "00002",
            ErrorCode::AuthTokenMissing => "00010",
            ErrorCode::AuthTokenInvalid => "00011",
            ErrorCode::AuthTokenExpired => "00012",

            ErrorCode::ProtocolInvalidFormat => "01001",
            ErrorCode::ProtocolMissingField => "01002",
            ErrorCode::ProtocolUnknownCommand => "01003",
            ErrorCode::ProtocolInvalidParams => "01004",

            ErrorCode::ProjectUploadFailed => "02001",
            ErrorCode::ProjectInvalidFormat => "02002",
            ErrorCode::ProjectLoadFailed => "02003",
            ErrorCode::ProjectNotFound => "02004",
            ErrorCode::ProjectSecurityViolation => "02005",

            ErrorCode::ExecutionFailed => "03001",
            ErrorCode::MethodNotFound => "03002",
            ErrorCode::ObjectNotFound => "03003",
            ErrorCode::ModuleLoadError => "03004",

            ErrorCode::InternalError => "99001",
            ErrorCode::UnknownError => "99999",
        }
    }

    pub const fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionRejected => "Connection rejected, another client is connected",
            ErrorCode::ConnectionLimitReached => "Connection limit reached",
            ErrorCode::AuthTokenMissing => "Missing authentication token",
            ErrorCode::AuthTokenInvalid => "Token is invalid",
            ErrorCode::AuthTokenExpired => "Token has expired",

            ErrorCode::ProtocolInvalidFormat => "Invalid request format",
            ErrorCode::ProtocolMissingField => "Missing required field",
            ErrorCode::ProtocolUnknownCommand => "Unknown command",
            ErrorCode::ProtocolInvalidParams => "Invalid parameters",

            ErrorCode::ProjectUploadFailed => "Project upload failed",
            ErrorCode::ProjectInvalidFormat => "Invalid project format",
            ErrorCode::ProjectLoadFailed => "Project failed to load",
            ErrorCode::ProjectNotFound => "No project loaded",
            ErrorCode::ProjectSecurityViolation => "Unsafe operation detected",

            ErrorCode::ExecutionFailed => "Execution failed",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::ObjectNotFound => "Object not found",
            ErrorCode::ModuleLoadError => "Module failed to load",

            ErrorCode::InternalError => "Internal error",
            ErrorCode::UnknownError => "Unknown error",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        const ALL: [ErrorCode; 20] = [
            ErrorCode::ConnectionRejected,
            ErrorCode::ConnectionLimitReached,
            ErrorCode::AuthTokenMissing,
            ErrorCode::AuthTokenInvalid,
            ErrorCode::AuthTokenExpired,
            ErrorCode::ProtocolInvalidFormat,
            ErrorCode::ProtocolMissingField,
            ErrorCode::ProtocolUnknownCommand,
            ErrorCode::ProtocolInvalidParams,
            ErrorCode::ProjectUploadFailed,
            ErrorCode::ProjectInvalidFormat,
            ErrorCode::ProjectLoadFailed,
            ErrorCode::ProjectNotFound,
            ErrorCode::ProjectSecurityViolation,
            ErrorCode::ExecutionFailed,
            ErrorCode::MethodNotFound,
            ErrorCode::ObjectNotFound,
            ErrorCode::ModuleLoadError,
            ErrorCode::InternalError,
            ErrorCode::UnknownError,
        ];

        ALL.into_iter().find(|c| c.code() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        ErrorCode::from_code(&code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code `{code}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::ConnectionRejected.code(), "00001");
        assert_eq!(ErrorCode::AuthTokenMissing.code(), "00010");
        assert_eq!(ErrorCode::AuthTokenInvalid.code(), "00011");
        assert_eq!(ErrorCode::ProtocolUnknownCommand.code(), "01003");
        assert_eq!(ErrorCode::ProjectNotFound.code(), "02004");
        assert_eq!(ErrorCode::ProjectSecurityViolation.code(), "02005");
        assert_eq!(ErrorCode::ExecutionFailed.code(), "03001");
        assert_eq!(ErrorCode::MethodNotFound.code(), "03002");
        assert_eq!(ErrorCode::ObjectNotFound.code(), "03003");
        assert_eq!(ErrorCode::InternalError.code(), "99001");
    }

    #[test]
    fn round_trips_through_serde() {
        let json = serde_json::to_string(&ErrorCode::ProjectSecurityViolation).unwrap();
        assert_eq!(json, "\"02005\"");

        let code: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(code, ErrorCode::ProjectSecurityViolation);
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(serde_json::from_str::<ErrorCode>("\"12345\"").is_err());
    }
}
