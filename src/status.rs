//! Call status codes.
//!
//! A call ends with exactly one [`StatusCode`]. The server picks it with
//! send-status; the engine picks it when a call is cancelled, runs past its
//! deadline, overflows a receive limit or finds no server.

use std::fmt;

/// Terminal status code of a call. The numeric values are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    /// Cancelled by either end, or by the server dropping the call.
    Cancelled = 1,
    /// Also used for codes outside the known range.
    Unknown = 2,
    InvalidArgument = 3,
    /// The call's deadline passed before it finished.
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    /// A received message was over the receive limit.
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    /// No server was listening on the target, or it was shutting down.
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

// indexed by wire value
const CODES: [(StatusCode, &str); 17] = [
    (StatusCode::Ok, "OK"),
    (StatusCode::Cancelled, "CANCELLED"),
    (StatusCode::Unknown, "UNKNOWN"),
    (StatusCode::InvalidArgument, "INVALID_ARGUMENT"),
    (StatusCode::DeadlineExceeded, "DEADLINE_EXCEEDED"),
    (StatusCode::NotFound, "NOT_FOUND"),
    (StatusCode::AlreadyExists, "ALREADY_EXISTS"),
    (StatusCode::PermissionDenied, "PERMISSION_DENIED"),
    (StatusCode::ResourceExhausted, "RESOURCE_EXHAUSTED"),
    (StatusCode::FailedPrecondition, "FAILED_PRECONDITION"),
    (StatusCode::Aborted, "ABORTED"),
    (StatusCode::OutOfRange, "OUT_OF_RANGE"),
    (StatusCode::Unimplemented, "UNIMPLEMENTED"),
    (StatusCode::Internal, "INTERNAL"),
    (StatusCode::Unavailable, "UNAVAILABLE"),
    (StatusCode::DataLoss, "DATA_LOSS"),
    (StatusCode::Unauthenticated, "UNAUTHENTICATED"),
];

impl StatusCode {
    /// Map a wire value to a code. Out-of-range values map to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        usize::try_from(value)
            .ok()
            .and_then(|i| CODES.get(i))
            .map_or(StatusCode::Unknown, |&(code, _)| code)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Canonical upper-case name, e.g. `DEADLINE_EXCEEDED`.
    pub fn name(self) -> &'static str {
        CODES[self as usize].1
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal status of a call: code, details and trailing metadata.
///
/// Produced either by the server's send-status operation or synthesized by
/// the engine when a call is cancelled, exceeds its deadline or cannot reach
/// a server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Status {
    pub(crate) code: StatusCode,
    pub(crate) details: String,
    pub(crate) trailing_metadata: crate::Metadata,
}

impl Status {
    pub(crate) fn new(
        code: StatusCode,
        details: impl Into<String>,
        trailing_metadata: crate::Metadata,
    ) -> Self {
        Self {
            code,
            details: details.into(),
            trailing_metadata,
        }
    }

    /// A status synthesized by the engine, carrying no trailing metadata.
    pub(crate) fn local(code: StatusCode, details: impl Into<String>) -> Self {
        Self::new(code, details, crate::Metadata::new())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for i in 0..=16 {
            let code = StatusCode::from_u32(i);
            assert_eq!(code.as_u32(), i);
        }
    }

    #[test]
    fn test_table_matches_discriminants() {
        for (i, (code, name)) in CODES.iter().enumerate() {
            assert_eq!(code.as_u32() as usize, i);
            assert_eq!(code.name(), *name);
        }
    }

    #[test]
    fn test_code_from_u32_unknown() {
        assert_eq!(StatusCode::from_u32(17), StatusCode::Unknown);
        assert_eq!(StatusCode::from_u32(u32::MAX), StatusCode::Unknown);
    }

    #[test]
    fn test_ok_is_zero() {
        assert_eq!(StatusCode::Ok.as_u32(), 0);
        assert!(StatusCode::Ok.is_ok());
        assert!(!StatusCode::Cancelled.is_ok());
    }

    #[test]
    fn test_code_display() {
        assert_eq!(format!("{}", StatusCode::Ok), "OK");
        assert_eq!(
            format!("{}", StatusCode::DeadlineExceeded),
            "DEADLINE_EXCEEDED"
        );
        assert_eq!(
            format!("{}", StatusCode::FailedPrecondition),
            "FAILED_PRECONDITION"
        );
        assert_eq!(format!("{}", StatusCode::Unauthenticated), "UNAUTHENTICATED");
    }

    #[test]
    fn test_status_display() {
        let status = Status::local(StatusCode::Unavailable, "no server");
        assert_eq!(format!("{}", status), "UNAVAILABLE: no server");

        let status = Status::local(StatusCode::Ok, "");
        assert_eq!(format!("{}", status), "OK");
    }

    #[test]
    fn test_status_local_has_no_trailers() {
        let status = Status::local(StatusCode::Cancelled, "cancelled");
        assert!(status.trailing_metadata.is_empty());
        assert_eq!(status.code, StatusCode::Cancelled);
    }
}
