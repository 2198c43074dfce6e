//! Data model for spans and the records exporters receive.

use chrono::{DateTime, Utc};
use llmscope_core::Attributes;
use serde::{Deserialize, Serialize};

/// Well-known attribute keys.
pub mod attr {
    /// Model identifier on `llm_call` spans.
    pub const LLM_MODEL: &str = "llm.model";
    /// Prompt token count on `llm_call` spans.
    pub const LLM_INPUT_TOKENS: &str = "llm.input_tokens";
    /// Completion token count on `llm_call` spans.
    pub const LLM_OUTPUT_TOKENS: &str = "llm.output_tokens";
    /// Estimated cost, when the model is priced.
    pub const LLM_COST: &str = "llm.cost";
    /// Provider name.
    pub const LLM_PROVIDER: &str = "llm.provider";
    /// Prefix for validator outcomes (`validation.<name>.passed` etc).
    pub const VALIDATION_PREFIX: &str = "validation";
}

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// In-process pipeline step.
    Internal,
    /// An LLM completion call.
    LlmCall,
    /// A tool execution.
    ToolCall,
    /// Any other out-of-process call.
    External,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::LlmCall => write!(f, "llm_call"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::External => write!(f, "external"),
        }
    }
}

/// How a span finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Error,
    Cancelled,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final status of a sealed span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpanStatus {
    pub code: StatusCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Set when the span closed after its parent had already closed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub orphaned: bool,
}

impl SpanStatus {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
            orphaned: false,
        }
    }
}

/// Identity of a span, cheap to copy across execution paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    /// Whether the trace is recorded for export.
    pub sampled: bool,
}

/// Numeric summary attached to an exported span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanMetrics {
    pub duration_ms: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl SpanMetrics {
    /// Total tokens (input + output), or 0 if not recorded.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

/// A sealed span, in the shape exporters receive it.
///
/// Records are only ever built by the tracer when a span ends and are shared
/// behind `Arc` afterwards; nothing mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,
    pub attributes: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_summary: Option<SpanMetrics>,

    /// Attributes discarded because the span hit its attribute limit.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped_attributes: u32,

    /// Sampling decision of the trace; not part of the exported shape.
    #[serde(skip, default = "default_sampled")]
    pub sampled: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn default_sampled() -> bool {
    true
}

impl SpanRecord {
    /// Duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        let micros = self
            .end_time
            .signed_duration_since(self.start_time)
            .num_microseconds()
            .unwrap_or(i64::MAX)
            .max(0);
        micros as f64 / 1000.0
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            sampled: self.sampled,
        }
    }

    /// Model id plus token counts, if this is a token-bearing LLM span.
    pub fn token_usage(&self) -> Option<(&str, u64, u64)> {
        if self.kind != SpanKind::LlmCall {
            return None;
        }
        let model = self.attributes.get(attr::LLM_MODEL)?.as_str()?;
        let input = self.attributes.get(attr::LLM_INPUT_TOKENS)?.as_u64()?;
        let output = self.attributes.get(attr::LLM_OUTPUT_TOKENS)?.as_u64()?;
        Some((model, input, output))
    }

    /// Serialize to the exported JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use llmscope_core::AttributeValue;

    fn record(kind: SpanKind) -> SpanRecord {
        let start = Utc::now();
        SpanRecord {
            trace_id: "t-1".into(),
            span_id: "s-1".into(),
            parent_span_id: None,
            name: "generate".into(),
            kind,
            start_time: start,
            end_time: start + Duration::milliseconds(250),
            status: SpanStatus::new(StatusCode::Ok),
            attributes: Attributes::new(),
            metrics_summary: None,
            dropped_attributes: 0,
            sampled: true,
        }
    }

    #[test]
    fn span_kind_display() {
        assert_eq!(SpanKind::Internal.to_string(), "internal");
        assert_eq!(SpanKind::LlmCall.to_string(), "llm_call");
        assert_eq!(SpanKind::ToolCall.to_string(), "tool_call");
        assert_eq!(SpanKind::External.to_string(), "external");
    }

    #[test]
    fn duration_is_derived_from_timestamps() {
        let r = record(SpanKind::Internal);
        assert!((r.duration_ms() - 250.0).abs() < 1e-9);
        assert!(r.is_root());
    }

    #[test]
    fn token_usage_requires_llm_kind_and_all_attributes() {
        let mut r = record(SpanKind::LlmCall);
        assert!(r.token_usage().is_none());

        r.attributes.insert(attr::LLM_MODEL.into(), "openai/gpt-4o".into());
        r.attributes.insert(attr::LLM_INPUT_TOKENS.into(), AttributeValue::Int(100));
        r.attributes.insert(attr::LLM_OUTPUT_TOKENS.into(), AttributeValue::Int(20));
        assert_eq!(r.token_usage(), Some(("openai/gpt-4o", 100, 20)));

        r.kind = SpanKind::ToolCall;
        assert!(r.token_usage().is_none());
    }

    #[test]
    fn exported_record_roundtrip() {
        let mut r = record(SpanKind::LlmCall);
        r.parent_span_id = Some("s-0".into());
        r.attributes.insert("llm.model".into(), "gpt-4o".into());
        r.attributes.insert("retries".into(), AttributeValue::Int(2));
        r.attributes.insert("tags".into(), vec!["a", "b"].into());
        r.metrics_summary = Some(SpanMetrics {
            duration_ms: 250.0,
            input_tokens: Some(10),
            output_tokens: None,
        });

        let json = r.to_json().unwrap();
        let back: SpanRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trace_id, r.trace_id);
        assert_eq!(back.span_id, r.span_id);
        assert_eq!(back.attributes, r.attributes);
        assert_eq!(back, r);
    }

    #[test]
    fn orphan_flag_only_serialized_when_set() {
        let mut r = record(SpanKind::Internal);
        assert!(!r.to_json().unwrap().contains("orphaned"));
        r.status.orphaned = true;
        assert!(r.to_json().unwrap().contains("\"orphaned\":true"));
        assert!(!r.to_json().unwrap().contains("sampled"));
    }
}
