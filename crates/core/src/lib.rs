//! # llmscope core
//!
//! Contracts shared between the telemetry engine and the code it observes.
//! Nothing in here performs I/O: the provider call and the output validators
//! are collaborators supplied by the caller, and this crate only fixes the
//! shapes they exchange with the instrumentation layer.
//!
//! ## Contents
//!
//! - [`attribute`]: the closed set of scalar values a span attribute may hold
//! - [`provider`]: the LLM call shape (prompt/model/parameters in, text + token counts out)
//! - [`validator`]: post-call output checks that yield pass/fail plus a score
//! - [`error`]: errors raised by collaborators

pub mod attribute;
pub mod error;
pub mod provider;
pub mod validator;

pub use attribute::{AttributeValue, Attributes};
pub use error::{ProviderError, ValidationError};
pub use provider::{Provider, ProviderOutput, ProviderRequest};
pub use validator::{Validator, Verdict};
