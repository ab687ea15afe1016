//! Error taxonomy for parsing and emitting.
//!
//! Every failure carries an [`ErrorKind`] plus a trail: the logical field path
//! (`outer.inner[3].name`) and the stream offset at the point of failure. The
//! engine prepends path segments as an error propagates out of nested fields,
//! so the caller of parse/emit sees where in the declaration the problem lies.

use std::fmt;

/// Discriminated failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// Ran out of bytes before the field could complete.
    #[error("stream exhausted: {0}")]
    StreamExhausted(String),
    /// Value cannot be serialized under the current constraints.
    #[error("write error: {0}")]
    WriteError(String),
    /// Constant mismatch, switch without a matching case, or a failed check.
    #[error("check failed: {0}")]
    CheckError(String),
    /// Integer value outside the representable range.
    #[error("integer overflow: {0}")]
    Overflow(String),
    /// A length was requested but depends on unknown context.
    #[error("impossible to calculate length: {0}")]
    ImpossibleToCalculateLength(String),
    /// Malformed data reported by a field variant.
    #[error("parse error: {0}")]
    ParseError(String),
    /// Context lookup failed.
    #[error("unknown field: {0}")]
    FieldNotFound(String),
    /// The structure declaration itself is invalid.
    #[error("definition error: {0}")]
    DefinitionError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An error with its field-path trail and stream offset.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    /// Logical field path, outermost first.
    pub path: Vec<String>,
    /// Stream offset at the point of failure, when known.
    pub offset: Option<u64>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, path: Vec::new(), offset: None }
    }

    pub fn stream_exhausted(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::StreamExhausted(msg.into()))
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::WriteError(msg.into()))
    }

    pub fn check(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::CheckError(msg.into()))
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Overflow(msg.into()))
    }

    pub fn unknown_length(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::ImpossibleToCalculateLength(msg.into()))
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::ParseError(msg.into()))
    }

    pub fn field_not_found(name: impl Into<String>) -> Self {
        Error::new(ErrorKind::FieldNotFound(name.into()))
    }

    pub fn definition(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::DefinitionError(msg.into()))
    }

    /// Prepends a path segment; used while unwinding out of a named field.
    pub fn in_field(mut self, name: &str) -> Self {
        self.path.insert(0, name.to_string());
        self
    }

    /// Records the stream offset, keeping the innermost one.
    pub fn at_offset(mut self, offset: u64) -> Self {
        if self.offset.is_none() {
            self.offset = Some(offset);
        }
        self
    }

    /// True when the error is a [`ErrorKind::StreamExhausted`]; unbounded
    /// arrays use this to absorb end-of-stream from their base field.
    pub fn is_stream_exhausted(&self) -> bool {
        matches!(self.kind, ErrorKind::StreamExhausted(_))
    }

    /// Formats the trail path, e.g. `outer.inner[3].name`.
    fn format_path(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            if seg.starts_with('[') || out.is_empty() {
                out.push_str(seg);
            } else {
                out.push('.');
                out.push_str(seg);
            }
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.path.is_empty() {
            write!(f, " (in {})", self.format_path())?;
        }
        if let Some(off) = self.offset {
            write!(f, " (at offset {})", off)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        // Streams layered through std::io wrap our errors as `Other`; unwrap
        // them so the original kind and trail survive the round trip.
        if err.get_ref().map(|e| e.is::<Error>()).unwrap_or(false) {
            match err.into_inner().map(|b| b.downcast::<Error>()) {
                Some(Ok(inner)) => return *inner,
                Some(Err(_)) | None => unreachable!("checked downcast"),
            }
        }
        Error::new(ErrorKind::Io(err))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error { kind: ErrorKind::Io(io), path, .. } if path.is_empty() => io,
            err => std::io::Error::new(std::io::ErrorKind::Other, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trail_formats_array_indices_without_dot() {
        let err = Error::parse("bad byte")
            .in_field("name")
            .in_field("[3]")
            .in_field("inner")
            .in_field("outer")
            .at_offset(17);
        assert_eq!(
            err.to_string(),
            "parse error: bad byte (in outer.inner[3].name) (at offset 17)"
        );
    }

    #[test]
    fn io_round_trip_preserves_kind() {
        let err = Error::stream_exhausted("short read").in_field("len");
        let io: std::io::Error = err.into();
        let back: Error = io.into();
        assert!(back.is_stream_exhausted());
        assert_eq!(back.path, vec!["len".to_string()]);
    }
}
