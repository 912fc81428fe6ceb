//! Error taxonomy for the port layer
//!
//! Every failure is a [`PortError`]: an [`ErrorKind`] plus a context trail of
//! the tree paths and record paths that were being processed when it happened.
//! The trail is pushed outward-in by [`ResultExt::context`], so the last frame
//! is the outermost operation.

use std::fmt;

use thiserror::Error;

/// Broad classification used by callers to pick a presentation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unknown paths, duplicate attributes, type mismatches. Never retried.
    Structural,
    /// Bad constraint values, arity mismatches, missing parameters.
    Argument,
    /// Stored state changed underneath the caller; refetch and resubmit.
    Conflict,
    /// Malformed write payloads.
    Payload,
    /// The store itself failed.
    Store,
}

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("path segment `{segment}` not found")]
    PathError { segment: String },

    #[error("unknown attribute `{name}`")]
    UnknownAttribute { name: String },

    #[error("duplicate attribute `{name}`")]
    DuplicateAttribute { name: String },

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("unbound name `{name}`")]
    UnboundName { name: String },

    #[error("operator `{operator}` is not supported by {kind} nodes")]
    UnsupportedOperator { operator: String, kind: String },

    #[error("{0}")]
    StructureError(String),

    #[error("invalid argument: {0}")]
    ArgumentError(String),

    #[error("missing value for parameter `${name}`")]
    MissingParameter { name: String },

    #[error("record {table}[{identity}] was modified concurrently: {detail}")]
    ConcurrentModification {
        table: String,
        identity: String,
        detail: String,
    },

    #[error("reference `{reference}` does not point to a record created earlier")]
    DanglingReference { reference: String },

    #[error("record {table}[{identity}] appears more than once")]
    DuplicateRecord { table: String, identity: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::PathError { .. }
            | ErrorKind::UnknownAttribute { .. }
            | ErrorKind::DuplicateAttribute { .. }
            | ErrorKind::TypeMismatch { .. }
            | ErrorKind::UnboundName { .. }
            | ErrorKind::UnsupportedOperator { .. }
            | ErrorKind::StructureError(_) => ErrorClass::Structural,
            ErrorKind::ArgumentError(_) | ErrorKind::MissingParameter { .. } => {
                ErrorClass::Argument
            }
            ErrorKind::ConcurrentModification { .. } => ErrorClass::Conflict,
            ErrorKind::DanglingReference { .. } | ErrorKind::DuplicateRecord { .. } => {
                ErrorClass::Payload
            }
            ErrorKind::Store(_) => ErrorClass::Store,
        }
    }
}

/// An [`ErrorKind`] with the trail of contexts it travelled through.
#[derive(Debug)]
pub struct PortError {
    pub kind: ErrorKind,
    pub trail: Vec<String>,
}

impl PortError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trail: Vec::new(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    /// Push an outer context frame.
    pub fn context(mut self, frame: impl Into<String>) -> Self {
        self.trail.push(frame.into());
        self
    }

    pub fn path_error(segment: impl Into<String>) -> Self {
        ErrorKind::PathError {
            segment: segment.into(),
        }
        .into()
    }

    pub fn unknown_attribute(name: impl Into<String>) -> Self {
        ErrorKind::UnknownAttribute { name: name.into() }.into()
    }

    pub fn duplicate_attribute(name: impl Into<String>) -> Self {
        ErrorKind::DuplicateAttribute { name: name.into() }.into()
    }

    pub fn type_mismatch(expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        ErrorKind::TypeMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
        .into()
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        ErrorKind::UnboundName { name: name.into() }.into()
    }

    pub fn unsupported(operator: impl Into<String>, kind: impl fmt::Display) -> Self {
        ErrorKind::UnsupportedOperator {
            operator: operator.into(),
            kind: kind.to_string(),
        }
        .into()
    }

    pub fn structure(message: impl Into<String>) -> Self {
        ErrorKind::StructureError(message.into()).into()
    }

    pub fn argument(message: impl Into<String>) -> Self {
        ErrorKind::ArgumentError(message.into()).into()
    }

    pub fn missing_parameter(name: impl Into<String>) -> Self {
        ErrorKind::MissingParameter { name: name.into() }.into()
    }

    pub fn conflict(
        table: impl Into<String>,
        identity: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        ErrorKind::ConcurrentModification {
            table: table.into(),
            identity: identity.to_string(),
            detail: detail.into(),
        }
        .into()
    }

    pub fn dangling(reference: impl Into<String>) -> Self {
        ErrorKind::DanglingReference {
            reference: reference.into(),
        }
        .into()
    }

    pub fn duplicate_record(table: impl Into<String>, identity: impl fmt::Display) -> Self {
        ErrorKind::DuplicateRecord {
            table: table.into(),
            identity: identity.to_string(),
        }
        .into()
    }
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trail {
            write!(f, "\n    while {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for PortError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<sqlx::Error> for PortError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorKind::Store(err))
    }
}

pub type Result<T, E = PortError> = std::result::Result<T, E>;

/// Attach context frames to fallible results.
pub trait ResultExt<T> {
    fn context(self, frame: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, frame: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<PortError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, frame: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(frame))
    }

    fn with_context<F, S>(self, frame: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(frame()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_renders_outermost_last() {
        let err: Result<()> = Err(PortError::unknown_attribute("sku"));
        let err = err
            .context("compiling order.item")
            .context("producing port")
            .unwrap_err();
        assert_eq!(err.trail, vec!["compiling order.item", "producing port"]);
        let text = err.to_string();
        assert!(text.starts_with("unknown attribute `sku`"));
        assert!(text.ends_with("while producing port"));
    }

    #[test]
    fn test_classes() {
        assert_eq!(PortError::path_error("x").class(), ErrorClass::Structural);
        assert_eq!(PortError::missing_parameter("u").class(), ErrorClass::Argument);
        assert_eq!(PortError::conflict("t", 1, "gone").class(), ErrorClass::Conflict);
        assert_eq!(PortError::dangling("order.0").class(), ErrorClass::Payload);
    }
}
