//! Output validators.
//!
//! A validator inspects generated text and returns a [`Verdict`]. Validators
//! are run after the provider call returns; their verdicts, and any
//! [`ValidationError`] they raise, are recorded on the call's span and never
//! reach the caller.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Outcome of a validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    /// Score in validator-defined units, usually 0.0..=1.0.
    pub score: f64,
}

impl Verdict {
    pub fn pass(score: f64) -> Self {
        Self { passed: true, score }
    }

    pub fn fail(score: f64) -> Self {
        Self { passed: false, score }
    }
}

/// A content/format check over response text.
pub trait Validator: Send + Sync {
    /// Stable name, used as the attribute key prefix (`validation.<name>.*`).
    fn name(&self) -> &str;

    fn validate(&self, text: &str) -> Result<Verdict, ValidationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NonEmpty;

    impl Validator for NonEmpty {
        fn name(&self) -> &str {
            "non_empty"
        }

        fn validate(&self, text: &str) -> Result<Verdict, ValidationError> {
            if text.trim().is_empty() {
                Ok(Verdict::fail(0.0))
            } else {
                Ok(Verdict::pass(1.0))
            }
        }
    }

    #[test]
    fn verdict_constructors() {
        assert!(Verdict::pass(0.9).passed);
        assert!(!Verdict::fail(0.1).passed);
    }

    #[test]
    fn validator_scores_text() {
        let v = NonEmpty;
        assert!(v.validate("ok").unwrap().passed);
        assert!(!v.validate("   ").unwrap().passed);
    }
}
