// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Kind-coded errors with a source chain, in the manner of gRPC status codes.

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Cancelled => "Cancelled",
            Unknown => "Unknown",
            InvalidArgument => "Invalid argument",
            DeadlineExceeded => "Deadline exceeded",
            NotFound => "Not found",
            AlreadyExists => "Already exists",
            PermissionDenied => "Permission denied",
            Unauthenticated => "Unauthenticated",
            ResourceExhausted => "Resource exhausted",
            FailedPrecondition => "Failed precondition",
            Aborted => "Aborted",
            OutOfRange => "Out of range",
            Unimplemented => "Unimplemented",
            Internal => "Internal",
            Unavailable => "Unavailable",
            DataLoss => "Data loss",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// The error type used throughout lightnvr.
///
/// Boxed so that `Result<T, Error>` stays a pointer wide on the `Ok` path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind, msg: Option<String>, source: Option<BoxedError>) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    pub fn wrap<E: Into<BoxedError>>(kind: ErrorKind, source: E) -> Self {
        Error::new(kind, None, Some(source.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object which displays the full chain of causes, separated
    /// by `: `. Meant for logging, e.g. `error!(err = %e.chain(), "...")`.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg.as_deref() {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

/// Displays an [`Error`] and all its causes.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur: Option<&(dyn StdError + 'static)> = self.0.source();
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            _ => ErrorKind::Internal,
        };
        Error::wrap(kind, e)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        let kind = match &e {
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            rusqlite::Error::SqliteFailure(f, _) => match f.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::ResourceExhausted,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => ErrorKind::DataLoss,
                ErrorCode::ConstraintViolation => ErrorKind::FailedPrecondition,
                ErrorCode::ReadOnly | ErrorCode::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        };
        Error::wrap(kind, e)
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        Error::wrap(ErrorKind::Cancelled, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, discarding any prior kind.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] and optional `msg(...)` and
/// `source(...)` clauses.
///
/// ```
/// use lightnvr_base::{err, ErrorKind};
/// let e = err!(Unavailable, msg("stream {} closed", "driveway"));
/// assert_eq!(e.kind(), ErrorKind::Unavailable);
/// assert_eq!(e.to_string(), "Unavailable: stream driveway closed");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, msg($($msg:tt)*), source($src:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some(Into::<$crate::BoxedError>::into($src)),
        )
    };
    ($kind:ident, source($src:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            None,
            Some(Into::<$crate::BoxedError>::into($src)),
        )
    };
}

/// Like [`err!`], but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_msg() {
        let e = crate::err!(NotFound, msg("recording {} missing", 42));
        assert_eq!(e.to_string(), "Not found: recording 42 missing");
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = crate::err!(Internal, msg("write failed"), source(io));
        let chained = e.chain().to_string();
        assert!(chained.contains("write failed"));
        assert!(chained.contains("disk on fire"));
    }

    #[test]
    fn io_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}
