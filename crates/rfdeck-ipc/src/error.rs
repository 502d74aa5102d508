use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
    pub retryable: bool,
    pub source: Option<String>,
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(ref detail) = self.detail {
            if !detail.is_empty() && detail != &self.message {
                write!(f, " ({})", detail)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for DaemonError {}

#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    BadRequest = 1,
    IncompatibleProtocol = 2,
    Forbidden = 4,
    NotFound = 5,
    Busy = 6,
    Timeout = 7,
    RateLimited = 8,
    Io = 9,
    SpawnFailed = 10,
    ProcessExited = 11,
    AlreadyRunning = 12,
    Internal = 16,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCode::BadRequest => "bad request",
            ErrorCode::IncompatibleProtocol => "protocol error",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not found",
            ErrorCode::Busy => "busy",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RateLimited => "rate limited",
            ErrorCode::Io => "I/O error",
            ErrorCode::SpawnFailed => "spawn failed",
            ErrorCode::ProcessExited => "process exited",
            ErrorCode::AlreadyRunning => "already running",
            ErrorCode::Internal => "internal error",
        };
        write!(f, "{}", label)
    }
}

impl DaemonError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            retryable,
            source: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_appends_distinct_detail() {
        let err = DaemonError::new(ErrorCode::Busy, "device busy", true).with_detail("owner=pagermon");
        assert_eq!(err.to_string(), "device busy (owner=pagermon)");

        let same = DaemonError::new(ErrorCode::Busy, "device busy", true).with_detail("device busy");
        assert_eq!(same.to_string(), "device busy");
    }

    #[test]
    fn error_code_serializes_as_number() {
        let json = serde_json::to_string(&ErrorCode::Forbidden).unwrap();
        assert_eq!(json, "4");
        let back: ErrorCode = serde_json::from_str("12").unwrap();
        assert_eq!(back, ErrorCode::AlreadyRunning);
    }
}
