//! Error handling for tremolo.
//!
//! Provides a unified error type based on gRPC status codes, with mappings
//! from the underlying libraries (I/O, decoding, audio output, HTTP) to
//! appropriate categories.
//!
//! # Example
//!
//! ```rust
//! use tremolo::error::{Error, Result};
//!
//! fn resolve(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(Error::invalid_argument("empty file name"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for tremolo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// HTTP Mapping: 499 Client Closed Request
    #[error("Operation was cancelled")]
    Cancelled = 1,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Unknown error")]
    Unknown = 2,

    /// HTTP Mapping: 400 Bad Request
    #[error("Invalid argument specified")]
    InvalidArgument = 3,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("Operation timed out")]
    DeadlineExceeded = 4,

    /// HTTP Mapping: 404 Not Found
    #[error("Not found")]
    NotFound = 5,

    /// HTTP Mapping: 409 Conflict
    #[error("Attempt to create what already exists")]
    AlreadyExists = 6,

    /// HTTP Mapping: 403 Forbidden
    #[error("Permission denied")]
    PermissionDenied = 7,

    /// HTTP Mapping: 429 Too Many Requests
    #[error("Resource has been exhausted")]
    ResourceExhausted = 8,

    /// HTTP Mapping: 400 Bad Request
    #[error("Invalid state")]
    FailedPrecondition = 9,

    /// HTTP Mapping: 409 Conflict
    #[error("Operation aborted")]
    Aborted = 10,

    /// HTTP Mapping: 400 Bad Request
    #[error("Out of range")]
    OutOfRange = 11,

    /// HTTP Mapping: 501 Not Implemented
    #[error("Not implemented")]
    Unimplemented = 12,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Internal error")]
    Internal = 13,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("Service unavailable")]
    Unavailable = 14,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Unrecoverable data loss or corruption")]
    DataLoss = 15,
}

macro_rules! constructor {
    ($name:ident, $kind:ident, $doc:literal) => {
        #[doc = $doc]
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self {
                kind: ErrorKind::$kind,
                error: error.into(),
            }
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructor!(aborted, Aborted, "Creates an error for interrupted operations.");
    constructor!(already_exists, AlreadyExists, "Creates an error for duplicate resources.");
    constructor!(cancelled, Cancelled, "Creates an error for cancelled operations.");
    constructor!(data_loss, DataLoss, "Creates an error for corrupted or lost data.");
    constructor!(
        deadline_exceeded,
        DeadlineExceeded,
        "Creates an error for operations that exceeded their deadline."
    );
    constructor!(
        failed_precondition,
        FailedPrecondition,
        "Creates an error for operations rejected by the current state."
    );
    constructor!(internal, Internal, "Creates an error for internal failures.");
    constructor!(invalid_argument, InvalidArgument, "Creates an error for invalid arguments.");
    constructor!(not_found, NotFound, "Creates an error for missing resources.");
    constructor!(out_of_range, OutOfRange, "Creates an error for out-of-range values.");
    constructor!(
        permission_denied,
        PermissionDenied,
        "Creates an error for insufficient permissions."
    );
    constructor!(
        resource_exhausted,
        ResourceExhausted,
        "Creates an error for exhausted resources."
    );
    constructor!(unavailable, Unavailable, "Creates an error for unavailable services.");
    constructor!(unimplemented, Unimplemented, "Creates an error for unimplemented features.");
    constructor!(unknown, Unknown, "Creates an error for unclassified failures.");
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    /// Maps standard IO errors to their logical equivalents:
    /// * `NotFound` -> `NotFound`
    /// * `ConnectionAborted` -> `Aborted`
    /// * `UnexpectedEof` -> `DataLoss`
    /// * etc.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

impl From<symphonia::core::errors::Error> for Error {
    /// Maps decoder errors based on their nature:
    /// * `IoError` -> by the underlying IO kind
    /// * `DecodeError` -> `DataLoss`
    /// * `SeekError` -> `OutOfRange`
    /// * `Unsupported` -> `Unimplemented`
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match err {
            IoError(err) => err.into(),
            DecodeError(_) => Self::data_loss(err),
            SeekError(_) => Self::out_of_range(err),
            Unsupported(_) => Self::unimplemented(err),
            LimitError(_) => Self::resource_exhausted(err),
            ResetRequired => Self::failed_precondition(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    /// Maps HTTP errors based on their nature:
    /// * Body errors -> `DataLoss`
    /// * Connect errors -> `Unavailable`
    /// * Timeout errors -> `DeadlineExceeded`
    /// * etc.
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() || err.is_redirect() {
            return Self::unavailable(err);
        }

        if err.is_status() {
            return Self::failed_precondition(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        Self::unknown(err)
    }
}

impl From<url::ParseError> for Error {
    /// Converts URL parsing errors to `InvalidArgument`.
    fn from(err: url::ParseError) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<toml::de::Error> for Error {
    /// Converts configuration parsing errors to `InvalidArgument`.
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<rodio::StreamError> for Error {
    /// Maps audio stream errors:
    /// * `NoDevice` -> `NotFound`
    /// * everything backend-related -> `Unavailable`
    fn from(e: rodio::StreamError) -> Self {
        use rodio::StreamError::*;
        match e {
            PlayStreamError(e) => Self::unavailable(e),
            DefaultStreamConfigError(e) => Self::unavailable(e),
            BuildStreamError(e) => Self::unavailable(e),
            SupportedStreamConfigsError(e) => Self::not_found(e),
            NoDevice => Self::not_found(e),
        }
    }
}

impl From<rodio::PlayError> for Error {
    /// Maps playback errors:
    /// * `DecoderError` -> `InvalidArgument`
    /// * `NoDevice` -> `NotFound`
    fn from(e: rodio::PlayError) -> Self {
        use rodio::PlayError::*;
        match e {
            DecoderError(e) => Self::invalid_argument(e),
            NoDevice => Self::not_found(e),
        }
    }
}

impl From<rodio::DevicesError> for Error {
    /// Converts audio device enumeration errors to `Unknown`.
    fn from(e: rodio::DevicesError) -> Self {
        Self::unknown(e.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for Error {
    /// Maps config errors:
    /// * `DeviceNotAvailable` -> `Unavailable`
    /// * `InvalidArgument` -> `InvalidArgument`
    /// * `BackendSpecific` -> `Unknown`
    fn from(e: cpal::SupportedStreamConfigsError) -> Self {
        use cpal::SupportedStreamConfigsError::*;
        match e {
            DeviceNotAvailable => Self::unavailable(e),
            InvalidArgument => Self::invalid_argument(e),
            BackendSpecific { err } => Self::unknown(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err: Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "aborted").into();
        assert_eq!(err.kind, ErrorKind::Aborted);
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::not_found("no such plugin");
        assert_eq!(err.to_string(), "Not found: no such plugin");
    }
}
