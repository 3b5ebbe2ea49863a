use thiserror::Error;

/// Errors raised while building or running the sampler.
///
/// Shape, prior and starting-value errors are detected before any
/// sampling happens and are returned to the caller. `SingularMatrix`
/// can also happen inside a chain, in which case the sampler stops that
/// chain and reports the failure in its [`ChainOutcome`](crate::ChainOutcome).
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum VcmError {
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
    #[error("{what} is singular or not positive definite")]
    SingularMatrix { what: &'static str },
    #[error("invalid prior {name} = {value}: {reason}")]
    InvalidPrior {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("{what} has invalid parameters (shape = {shape}, scale = {scale})")]
    InvalidDistribution {
        what: &'static str,
        shape: f64,
        scale: f64,
    },
    #[error("invalid starting value {name} = {value}: must be finite and positive")]
    InvalidStartingValue { name: &'static str, value: f64 },
}

pub type Result<T> = std::result::Result<T, VcmError>;

impl VcmError {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Display,
        found: impl std::fmt::Display,
    ) -> Self {
        VcmError::ShapeMismatch {
            what,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn singular(what: &'static str) -> Self {
        VcmError::SingularMatrix { what }
    }

    /// Numerical failures stop a single chain; everything else is a
    /// configuration problem.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            VcmError::SingularMatrix { .. } | VcmError::InvalidDistribution { .. }
        )
    }
}
