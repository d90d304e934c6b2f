//! RPC status codes and the `Status` result type.

use std::fmt;

/// RPC status codes.
///
/// These are the canonical gRPC-style codes; they are distinct from both
/// HTTP status codes and HTTP/2 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Invalid argument was provided.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Permission denied.
    PermissionDenied = 7,
    /// A resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Create a `Code` from its numeric value. Unrecognized values map to
    /// [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Get the numeric value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Check whether this is the successful status code.
    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{}", name)
    }
}

/// Terminal result of an RPC stream or of the transport itself.
///
/// A `Status` pairs a [`Code`] with an optional human-readable description
/// and an optional cause (the rendered source error, e.g. an I/O failure).
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    description: Option<String>,
    cause: Option<String>,
}

impl Status {
    /// Create a status with a description.
    pub fn new(code: Code, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
            cause: None,
        }
    }

    /// Create an OK status.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// Create a status from just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            description: None,
            cause: None,
        }
    }

    /// Create a cancelled status.
    pub fn cancelled(description: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, description)
    }

    /// Create an unknown status.
    pub fn unknown(description: impl Into<String>) -> Self {
        Self::new(Code::Unknown, description)
    }

    /// Create an internal error status.
    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(Code::Internal, description)
    }

    /// Create an unavailable status.
    pub fn unavailable(description: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, description)
    }

    /// Create a resource-exhausted status.
    pub fn resource_exhausted(description: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, description)
    }

    /// Create a permission-denied status.
    pub fn permission_denied(description: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, description)
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Get the cause, if any.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Check whether this is a successful status.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Return a copy of this status carrying the given cause.
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Return a copy of this status with additional detail appended to the
    /// description.
    pub fn augment_description(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.description = Some(match self.description.take() {
            Some(existing) => format!("{}\n{}", existing, detail),
            None => detail,
        });
        self
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(description) = &self.description {
            write!(f, ": {}", description)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for i in 0..=16 {
            assert_eq!(Code::from_u32(i).as_u32(), i);
        }
    }

    #[test]
    fn code_from_u32_out_of_range() {
        assert_eq!(Code::from_u32(17), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
    }

    #[test]
    fn status_ok() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert_eq!(status.code(), Code::Ok);
        assert!(status.description().is_none());
    }

    #[test]
    fn status_with_description() {
        let status = Status::unavailable("Transport stopped");
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.description(), Some("Transport stopped"));
    }

    #[test]
    fn status_with_cause() {
        let status = Status::from_code(Code::Unavailable).with_cause("connection reset");
        assert_eq!(status.cause(), Some("connection reset"));
        assert!(status.description().is_none());
    }

    #[test]
    fn augment_appends() {
        let status = Status::internal("Protocol error").augment_description("stream 7");
        assert_eq!(status.description(), Some("Protocol error\nstream 7"));
    }

    #[test]
    fn augment_without_existing_description() {
        let status = Status::from_code(Code::Unavailable).augment_description("goodbye");
        assert_eq!(status.description(), Some("goodbye"));
    }

    #[test]
    fn display_includes_code_and_description() {
        let status = Status::internal("Stream ids exhausted");
        assert_eq!(format!("{}", status), "INTERNAL: Stream ids exhausted");
        assert_eq!(format!("{}", Status::ok()), "OK");
    }
}
