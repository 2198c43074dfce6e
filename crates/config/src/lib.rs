//! Configuration loading and validation for llmscope.
//!
//! Loads a `TelemetryConfig` from TOML with environment variable overrides.
//! All settings are validated before the telemetry engine is built; an
//! invalid option is a startup failure, never a runtime surprise.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `sampling_rate`.
pub const ENV_SAMPLING_RATE: &str = "LLMSCOPE_SAMPLING_RATE";
/// Environment variable overriding `budget.threshold`.
pub const ENV_BUDGET_THRESHOLD: &str = "LLMSCOPE_BUDGET_THRESHOLD";

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Fraction of traces fully recorded and exported (0.0 - 1.0).
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Export queue, batching and delivery settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Metric aggregation settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Optional spending budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetConfig>,

    /// Per-span limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Custom model pricing overrides (model name → pricing)
    #[serde(default)]
    pub pricing: HashMap<String, PricingOverrideConfig>,
}

fn default_sampling_rate() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            export: ExportConfig::default(),
            metrics: MetricsConfig::default(),
            budget: None,
            limits: LimitsConfig::default(),
            pricing: HashMap::new(),
        }
    }
}

/// What the export queue does when a producer pushes into a full queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait until the dispatcher frees a slot.
    Block,
    /// Evict the oldest queued item to make room.
    #[default]
    DropOldest,
    /// Discard the item being pushed.
    DropNewest,
    /// Reject the push with an error.
    FailFast,
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropOldest => write!(f, "drop_oldest"),
            Self::DropNewest => write!(f, "drop_newest"),
            Self::FailFast => write!(f, "fail_fast"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Maximum items per dispatched batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delivery attempts per batch per exporter, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Timeout applied to every exporter call
    #[serde(default = "default_exporter_timeout_ms")]
    pub exporter_timeout_ms: u64,

    /// Batches buffered per exporter before new batches are dropped for it
    #[serde(default = "default_exporter_buffer")]
    pub exporter_buffer: usize,

    /// How often the dispatcher drains a partially filled queue
    #[serde(default = "default_export_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Shutdown deadline for flushing pending batches
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    2048
}
fn default_batch_size() -> usize {
    128
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_exporter_timeout_ms() -> u64 {
    10_000
}
fn default_exporter_buffer() -> usize {
    16
}
fn default_export_flush_interval_ms() -> u64 {
    1_000
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            exporter_timeout_ms: default_exporter_timeout_ms(),
            exporter_buffer: default_exporter_buffer(),
            flush_interval_ms: default_export_flush_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ExportConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn exporter_timeout(&self) -> Duration {
        Duration::from_millis(self.exporter_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// How often every open window is flushed
    #[serde(default = "default_metrics_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// A window is flushed early once it holds this many samples
    #[serde(default = "default_max_samples_per_window")]
    pub max_samples_per_window: u64,

    /// Relative error bound of percentile estimates (e.g. 0.01 = 1%)
    #[serde(default = "default_relative_error")]
    pub relative_error: f64,

    /// Quantiles reported on every flushed window
    #[serde(default = "default_quantiles")]
    pub quantiles: Vec<f64>,
}

fn default_metrics_flush_interval_ms() -> u64 {
    10_000
}
fn default_max_samples_per_window() -> u64 {
    10_000
}
fn default_relative_error() -> f64 {
    0.01
}
fn default_quantiles() -> Vec<f64> {
    vec![0.5, 0.9, 0.99]
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_metrics_flush_interval_ms(),
            max_samples_per_window: default_max_samples_per_window(),
            relative_error: default_relative_error(),
            quantiles: default_quantiles(),
        }
    }
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Action taken on new work once the budget is exceeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    /// Refuse new LLM calls; calls already in flight finish.
    #[default]
    Deny,
    /// Log a warning but allow.
    Warn,
}

/// A process-wide spending budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Spend above which the budget counts as exceeded
    pub threshold: f64,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub on_exceed: BudgetAction,
}

fn default_currency() -> String {
    "USD".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Attributes beyond this count are dropped from a span
    #[serde(default = "default_max_attributes_per_span")]
    pub max_attributes_per_span: usize,
}

fn default_max_attributes_per_span() -> usize {
    128
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_attributes_per_span: default_max_attributes_per_span(),
        }
    }
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

impl TelemetryConfig {
    /// Load configuration from a specific file path, then apply environment
    /// overrides (`LLMSCOPE_SAMPLING_RATE`, `LLMSCOPE_BUDGET_THRESHOLD`).
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SAMPLING_RATE) {
            self.sampling_rate = parse_env(ENV_SAMPLING_RATE, &raw)?;
        }

        if let Some(raw) = lookup(ENV_BUDGET_THRESHOLD) {
            let threshold = parse_env(ENV_BUDGET_THRESHOLD, &raw)?;
            match self.budget.as_mut() {
                Some(budget) => budget.threshold = threshold,
                None => {
                    self.budget = Some(BudgetConfig {
                        threshold,
                        currency: default_currency(),
                        on_exceed: BudgetAction::default(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(invalid("sampling_rate must be between 0.0 and 1.0"));
        }

        let export = &self.export;
        if export.queue_capacity == 0 {
            return Err(invalid("export.queue_capacity must be > 0"));
        }
        if export.batch_size == 0 {
            return Err(invalid("export.batch_size must be > 0"));
        }
        if export.batch_size > export.queue_capacity {
            return Err(invalid(
                "export.batch_size must not exceed export.queue_capacity",
            ));
        }
        if export.max_attempts == 0 {
            return Err(invalid("export.max_attempts must be >= 1"));
        }
        if export.initial_backoff_ms > export.max_backoff_ms {
            return Err(invalid(
                "export.initial_backoff_ms must not exceed export.max_backoff_ms",
            ));
        }
        if export.exporter_timeout_ms == 0 {
            return Err(invalid("export.exporter_timeout_ms must be > 0"));
        }
        if export.exporter_buffer == 0 {
            return Err(invalid("export.exporter_buffer must be > 0"));
        }
        if export.flush_interval_ms == 0 {
            return Err(invalid("export.flush_interval_ms must be > 0"));
        }

        let metrics = &self.metrics;
        if metrics.flush_interval_ms == 0 {
            return Err(invalid("metrics.flush_interval_ms must be > 0"));
        }
        if metrics.max_samples_per_window == 0 {
            return Err(invalid("metrics.max_samples_per_window must be > 0"));
        }
        if !(metrics.relative_error > 0.0 && metrics.relative_error < 1.0) {
            return Err(invalid("metrics.relative_error must be in (0.0, 1.0)"));
        }
        if metrics.quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
            return Err(invalid("metrics.quantiles must all be in [0.0, 1.0]"));
        }

        if let Some(budget) = &self.budget {
            if !budget.threshold.is_finite() || budget.threshold <= 0.0 {
                return Err(invalid("budget.threshold must be a positive number"));
            }
            if budget.currency.trim().is_empty() {
                return Err(invalid("budget.currency must not be empty"));
            }
        }

        if self.limits.max_attributes_per_span == 0 {
            return Err(invalid("limits.max_attributes_per_span must be > 0"));
        }

        for (model, price) in &self.pricing {
            let valid = |p: f64| p.is_finite() && p >= 0.0;
            if !valid(price.input_per_m) || !valid(price.output_per_m) {
                return Err(ConfigError::ValidationError(format!(
                    "pricing for '{model}' must be a finite, non-negative number"
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn parse_env(key: &str, raw: &str) -> Result<f64, ConfigError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| ConfigError::ValidationError(format!("{key}={raw:?} is not a number: {e}")))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = TelemetryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.export.backpressure, BackpressurePolicy::DropOldest);
        assert!((config.sampling_rate - 1.0).abs() < f64::EPSILON);
        assert!(config.budget.is_none());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = TelemetryConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: TelemetryConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.export.queue_capacity, config.export.queue_capacity);
        assert_eq!(parsed.metrics.quantiles, config.metrics.quantiles);
    }

    #[test]
    fn parses_full_document() {
        let toml_str = r#"
sampling_rate = 0.25

[export]
queue_capacity = 3
batch_size = 2
backpressure = "fail_fast"
max_attempts = 5

[metrics]
flush_interval_ms = 500
relative_error = 0.02

[budget]
threshold = 10.0
currency = "EUR"
on_exceed = "warn"

[pricing."acme/tiny"]
input_per_m = 0.1
output_per_m = 0.2
"#;
        let config = TelemetryConfig::from_toml_str(toml_str).unwrap();
        assert!((config.sampling_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.export.queue_capacity, 3);
        assert_eq!(config.export.backpressure, BackpressurePolicy::FailFast);
        assert_eq!(config.export.max_attempts, 5);
        assert_eq!(config.export.batch_size, 2);
        assert_eq!(config.metrics.flush_interval(), Duration::from_millis(500));
        let budget = config.budget.unwrap();
        assert_eq!(budget.currency, "EUR");
        assert_eq!(budget.on_exceed, BudgetAction::Warn);
        assert!(config.pricing.contains_key("acme/tiny"));
    }

    #[test]
    fn invalid_sampling_rate_rejected() {
        let config = TelemetryConfig {
            sampling_rate: 1.5,
            ..TelemetryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let mut config = TelemetryConfig::default();
        config.export.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_larger_than_queue_rejected() {
        let mut config = TelemetryConfig::default();
        config.export.queue_capacity = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("export.batch_size"));

        config.export.batch_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_finite_prices_rejected() {
        for price in ["nan", "inf", "-1.0"] {
            let toml_str = format!(
                "[pricing.\"acme/tiny\"]\ninput_per_m = {price}\noutput_per_m = 0.2\n"
            );
            let err = TelemetryConfig::from_toml_str(&toml_str).unwrap_err();
            assert!(err.to_string().contains("acme/tiny"), "{price}: {err}");
        }

        let mut config = TelemetryConfig::default();
        config.pricing.insert(
            "acme/tiny".into(),
            PricingOverrideConfig {
                input_per_m: 0.1,
                output_per_m: f64::INFINITY,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backpressure_policy_is_a_parse_error() {
        let err = TelemetryConfig::from_toml_str("[export]\nbackpressure = \"shrug\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn budget_threshold_must_be_positive() {
        let err = TelemetryConfig::from_toml_str("[budget]\nthreshold = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("budget.threshold"));
    }

    #[test]
    fn quantiles_out_of_range_rejected() {
        let mut config = TelemetryConfig::default();
        config.metrics.quantiles = vec![0.5, 1.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TelemetryConfig::default();
        config
            .apply_overrides(|key| match key {
                ENV_SAMPLING_RATE => Some("0.5".into()),
                ENV_BUDGET_THRESHOLD => Some("12.5".into()),
                _ => None,
            })
            .unwrap();
        assert!((config.sampling_rate - 0.5).abs() < f64::EPSILON);
        let budget = config.budget.unwrap();
        assert!((budget.threshold - 12.5).abs() < f64::EPSILON);
        assert_eq!(budget.currency, "USD");
    }

    #[test]
    fn malformed_env_override_rejected() {
        let mut config = TelemetryConfig::default();
        let result = config.apply_overrides(|key| {
            (key == ENV_SAMPLING_RATE).then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = TelemetryConfig::load_from(Path::new("/nonexistent/llmscope.toml"));
        assert!(result.is_ok());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sampling_rate = 0.1\n[export]\nbatch_size = 7").unwrap();
        let config = TelemetryConfig::load_from(file.path()).unwrap();
        assert_eq!(config.export.batch_size, 7);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = TelemetryConfig::default_toml();
        assert!(toml_str.contains("drop_oldest"));
        assert!(toml_str.contains("queue_capacity"));
    }
}
