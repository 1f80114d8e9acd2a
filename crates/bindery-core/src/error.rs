#![forbid(unsafe_code)]

//! Binding error taxonomy.
//!
//! Errors are local to the binding that produced them. Nothing in the engine
//! propagates a [`BindingError`] through an evaluation walk: a failing binding
//! keeps its last good value, records the error, and reports "unchanged" so
//! its dependents are left alone.
//!
//! # Failure Modes
//!
//! | Kind | Cause | Behavior |
//! |------|-------|----------|
//! | `BindingLoop` | A binding re-entered its own evaluation | Evaluation aborted, value kept |
//! | `EvaluationError` | A fallible closure returned `Err` | Value kept, no notification |
//! | `UnknownError` | Misuse (e.g. binding already attached elsewhere) | Request ignored |

use std::fmt;

/// Category of a [`BindingError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BindingErrorKind {
    /// The binding evaluated cleanly (or was never evaluated).
    #[default]
    NoError,
    /// The binding observed itself, directly or through a cycle.
    BindingLoop,
    /// A host-supplied closure reported a failure.
    EvaluationError,
    /// Anything else.
    UnknownError,
}

impl fmt::Display for BindingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "no error",
            Self::BindingLoop => "binding loop",
            Self::EvaluationError => "evaluation error",
            Self::UnknownError => "unknown error",
        };
        f.write_str(name)
    }
}

/// Error state of a binding: a kind plus a free-form description.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("{kind}{}", description_suffix(.description))]
pub struct BindingError {
    kind: BindingErrorKind,
    description: String,
}

impl BindingError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: BindingErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Shorthand for an [`BindingErrorKind::EvaluationError`].
    #[must_use]
    pub fn evaluation(description: impl Into<String>) -> Self {
        Self::new(BindingErrorKind::EvaluationError, description)
    }

    /// The "no error" value.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kind(&self) -> BindingErrorKind {
        self.kind
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this value carries an actual error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind != BindingErrorKind::NoError
    }

    pub(crate) fn binding_loop() -> Self {
        Self::new(BindingErrorKind::BindingLoop, "")
    }
}

fn description_suffix(description: &str) -> String {
    if description.is_empty() {
        String::new()
    } else {
        format!(": {description}")
    }
}

impl From<BindingErrorKind> for BindingError {
    fn from(kind: BindingErrorKind) -> Self {
        Self::new(kind, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_no_error() {
        let err = BindingError::default();
        assert_eq!(err.kind(), BindingErrorKind::NoError);
        assert!(!err.is_error());
        assert_eq!(err.description(), "");
    }

    #[test]
    fn display_includes_description() {
        let err = BindingError::evaluation("division by zero");
        assert_eq!(err.to_string(), "evaluation error: division by zero");

        let bare: BindingError = BindingErrorKind::BindingLoop.into();
        assert_eq!(bare.to_string(), "binding loop");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let err = BindingError::new(BindingErrorKind::UnknownError, "oops");
        let json = serde_json::to_string(&err).unwrap();
        let back: BindingError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
