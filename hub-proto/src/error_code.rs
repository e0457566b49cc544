//! Closed error code vocabulary carried in `Frame::error`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel error codes exchanged over the wire.
///
/// Closed by design: new failure modes get a new variant here rather than a
/// free-form string, so the dispatcher and every client agree on the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    RateLimit,
    InvalidMessage,
    UnknownType,
    HandlerFailed,
    TargetOffline,
    NotFound,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "ERR_UNAUTHORIZED",
            Self::Forbidden => "ERR_FORBIDDEN",
            Self::RateLimit => "ERR_RATE_LIMIT",
            Self::InvalidMessage => "ERR_INVALID_MESSAGE",
            Self::UnknownType => "ERR_UNKNOWN_TYPE",
            Self::HandlerFailed => "ERR_HANDLER_FAILED",
            Self::TargetOffline => "ERR_TARGET_OFFLINE",
            Self::NotFound => "ERR_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized error code string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognized error code: {0}")]
pub struct UnknownErrorCode(pub String);

impl std::str::FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERR_UNAUTHORIZED" => Ok(Self::Unauthorized),
            "ERR_FORBIDDEN" => Ok(Self::Forbidden),
            "ERR_RATE_LIMIT" => Ok(Self::RateLimit),
            "ERR_INVALID_MESSAGE" => Ok(Self::InvalidMessage),
            "ERR_UNKNOWN_TYPE" => Ok(Self::UnknownType),
            "ERR_HANDLER_FAILED" => Ok(Self::HandlerFailed),
            "ERR_TARGET_OFFLINE" => Ok(Self::TargetOffline),
            "ERR_NOT_FOUND" => Ok(Self::NotFound),
            other => Err(UnknownErrorCode(other.to_string())),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::RateLimit,
            ErrorCode::InvalidMessage,
            ErrorCode::UnknownType,
            ErrorCode::HandlerFailed,
            ErrorCode::TargetOffline,
            ErrorCode::NotFound,
        ] {
            let s = code.as_str();
            let parsed: ErrorCode = s.parse().unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        let result = "ERR_MADE_UP".parse::<ErrorCode>();
        assert!(result.is_err());
    }

    #[test]
    fn serializes_as_bare_string() {
        let json = serde_json::to_string(&ErrorCode::Forbidden).unwrap();
        assert_eq!(json, "\"ERR_FORBIDDEN\"");
    }
}
