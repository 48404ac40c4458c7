//! Error types for the fitting core.
//!
//! Mirrors the error taxonomy of the original implementation: a
//! recoverable [`FitError::Range`] raised when a model is evaluated
//! outside its physical domain, a [`FitError::Runtime`] for I/O, parse
//! and linear-algebra failures, an [`FitError::Internal`] for invariant
//! violations, and [`FitError::Cancelled`] standing in for the
//! cooperative-cancellation control flow.

use thiserror::Error;

/// Errors raised anywhere in the fitting core.
#[derive(Error, Debug, Clone)]
pub enum FitError {
    /// The model was evaluated outside its physical domain. Recoverable:
    /// a trial step that raises this is simply rejected; the same error
    /// from the very first evaluation is fatal (see the engine).
    #[error("parameter out of range: {parameter} = {value}")]
    Range { parameter: String, value: f64 },

    /// I/O, parsing, or linear-algebra failure (e.g. a singular Schur
    /// complement in `ABDMatrix::solve`). Aborts the current operation.
    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// An invariant was violated (e.g. a `fit_index` mismatch). Aborts
    /// the entire fit.
    #[error("internal error: {message} (at {location})")]
    Internal {
        message: String,
        location: &'static str,
    },

    /// Cooperative cancellation requested; not a real error, just a
    /// control-flow signal threaded through `Result`.
    #[error("fit cancelled")]
    Cancelled,
}

impl FitError {
    pub fn range(parameter: impl Into<String>, value: f64) -> Self {
        FitError::Range {
            parameter: parameter.into(),
            value,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        FitError::Runtime {
            message: message.into(),
        }
    }

    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        FitError::Internal {
            message: message.into(),
            location: Box::leak(format!("{}:{}", loc.file(), loc.line()).into_boxed_str()),
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, FitError::Range { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FitError::Cancelled)
    }
}

/// Errors specific to parsing the parameter-file format (§6).
#[derive(Error, Debug, Clone)]
pub enum ParameterFileError {
    #[error("too many unrecognised lines ({count}), aborting load")]
    TooManyErrors { count: usize },

    #[error("no such parameter: '{name}'")]
    UnknownParameter { name: String },

    #[error("dataset index {index} out of range (have {count} datasets)")]
    DatasetOutOfRange { index: usize, count: usize },
}

/// Errors specific to parsing/writing the trajectory-file format (§6/§4.12).
#[derive(Error, Debug, Clone)]
pub enum TrajectoryFileError {
    #[error("malformed trajectory header: '{line}'")]
    MalformedHeader { line: String },

    #[error("malformed key=value line: '{line}'")]
    MalformedLine { line: String },

    #[error("vector length mismatch in field '{field}': expected {expected}, got {actual}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_message() {
        let e = FitError::range("k", 1.5e10);
        assert!(e.to_string().contains("k"));
        assert!(e.is_range());
    }

    #[test]
    fn test_internal_error_captures_location() {
        let e = FitError::internal("fit_index mismatch");
        let msg = e.to_string();
        assert!(msg.contains("fit_index mismatch"));
        assert!(msg.contains("errors.rs"));
    }

    #[test]
    fn test_cancelled_is_cancelled() {
        assert!(FitError::Cancelled.is_cancelled());
        assert!(!FitError::runtime("x").is_cancelled());
    }

    #[test]
    fn test_parameter_file_error_messages() {
        let e = ParameterFileError::UnknownParameter {
            name: "foo".to_string(),
        };
        assert!(e.to_string().contains("foo"));
    }
}
