//! `simulate`: drive synthetic pipelines through the telemetry engine.
//!
//! Each simulated request is one trace: a root `pipeline` span, a
//! `retrieve` tool call, and an `llm_call` against a fake provider whose
//! token counts scale with the prompt. Useful for checking a config's
//! budget, sampling and export settings without a real model.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Args;
use llmscope_config::TelemetryConfig;
use llmscope_core::{
    Provider, ProviderError, ProviderOutput, ProviderRequest, ValidationError, Validator, Verdict,
};
use llmscope_telemetry::{
    Context, Exporter, JsonLinesExporter, LlmCallError, SpanKind, TelemetryEngine,
};
use rand::Rng;
use tracing::{info, warn};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of pipeline runs
    #[arg(short = 'n', long, default_value_t = 20)]
    pub requests: usize,

    /// Runs in flight at once
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Model id to bill calls against
    #[arg(short, long, default_value = "openai/gpt-4o-mini")]
    pub model: String,

    /// Fraction of provider calls that fail (0.0 - 1.0)
    #[arg(long, default_value_t = 0.0)]
    pub failure_rate: f64,

    /// Simulated provider latency in milliseconds
    #[arg(long, default_value_t = 25)]
    pub latency_ms: u64,

    /// Write exported spans and metric windows to stdout as JSON lines
    #[arg(long)]
    pub export: bool,
}

/// Provider that fabricates completions and token counts.
pub struct SimulatedProvider {
    failure_rate: f64,
    latency: Duration,
}

impl SimulatedProvider {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
        }
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        tokio::time::sleep(self.latency).await;
        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            return Err(ProviderError::ApiError {
                status_code: 503,
                message: "simulated outage".into(),
            });
        }
        // Roughly four characters per token.
        let input_tokens = (request.prompt.len() / 4).max(1) as u32;
        let output_tokens = input_tokens / 2 + 16;
        Ok(ProviderOutput {
            text: format!("summary of {} prompt tokens", input_tokens),
            input_tokens,
            output_tokens,
        })
    }
}

/// Passes any non-blank output.
pub struct NonEmpty;

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

pub async fn run(path: &Path, args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = TelemetryConfig::load_from(path)?;
    let exporters: Vec<Arc<dyn Exporter>> = if args.export {
        vec![Arc::new(JsonLinesExporter::stdout())]
    } else {
        Vec::new()
    };
    let engine = Arc::new(TelemetryEngine::from_config(
        config,
        exporters,
        vec![Arc::new(NonEmpty)],
    )?);
    let provider = Arc::new(SimulatedProvider::new(
        args.failure_rate,
        Duration::from_millis(args.latency_ms),
    ));

    let started = Utc::now();
    let outcome = simulate(&engine, provider, &args).await;
    let report = engine.shutdown().await;

    let summary = engine
        .costs()
        .cost_summary(started - ChronoDuration::seconds(1), Utc::now());
    let stats = engine.stats();

    eprintln!();
    eprintln!("📊 Simulation");
    eprintln!("─────────────────────────────────────");
    eprintln!("  Runs:            {}", args.requests);
    eprintln!("  Succeeded:       {}", outcome.succeeded);
    eprintln!("  Provider errors: {}", outcome.failed);
    eprintln!("  Refused:         {}", outcome.refused);
    eprintln!(
        "  Spend:           {:.6} {} over {} calls",
        summary.total_cost, summary.currency, summary.llm_calls
    );
    if summary.unpriced_calls > 0 {
        eprintln!("  Unpriced calls:  {}", summary.unpriced_calls);
    }
    eprintln!(
        "  Export:          {} queued, {} dropped, {} discarded at shutdown",
        stats.enqueued, stats.dropped, report.discarded
    );
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Outcome {
    succeeded: usize,
    failed: usize,
    refused: usize,
}

async fn simulate(
    engine: &Arc<TelemetryEngine>,
    provider: Arc<SimulatedProvider>,
    args: &SimulateArgs,
) -> Outcome {
    let mut outcome = Outcome::default();
    let mut remaining = args.requests;
    let mut run_id = 0usize;

    while remaining > 0 {
        let wave = remaining.min(args.concurrency.max(1));
        let mut handles = Vec::with_capacity(wave);
        for _ in 0..wave {
            run_id += 1;
            let engine = Arc::clone(engine);
            let provider = Arc::clone(&provider);
            let model = args.model.clone();
            handles.push(tokio::spawn(async move {
                run_pipeline(&engine, provider.as_ref(), &model, run_id).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => outcome.succeeded += 1,
                Ok(Err(LlmCallError::Provider(_))) => outcome.failed += 1,
                Ok(Err(LlmCallError::BudgetExceeded { .. })) => outcome.refused += 1,
                Err(e) => warn!(error = %e, "Simulated run panicked"),
            }
        }
        remaining -= wave;
    }
    info!(?outcome, "Simulation finished");
    outcome
}

async fn run_pipeline(
    engine: &TelemetryEngine,
    provider: &dyn Provider,
    model: &str,
    run_id: usize,
) -> Result<(), LlmCallError> {
    let scope = Context::current().with_values([("run_id", run_id as i64)]);
    let tracer = engine.tracer();
    let steps = tracer.clone();

    scope
        .attach(tracer.in_span_async("pipeline", SpanKind::Internal, |root| async move {
            let _ = root.set_attribute("run_id", run_id as i64);

            let documents = steps.in_span("retrieve", SpanKind::ToolCall, |span| {
                let docs = 3 + run_id % 4;
                span.set_attribute("documents", docs as i64)?;
                Ok::<usize, llmscope_telemetry::TelemetryError>(docs)
            });
            let documents = documents.unwrap_or(0);

            let prompt = "context ".repeat(documents * 64) + "question";
            engine
                .llm_call(provider, ProviderRequest::new(model, prompt))
                .await
                .map(|_| ())
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmscope_config::{BudgetAction, BudgetConfig};

    fn args(requests: usize) -> SimulateArgs {
        SimulateArgs {
            requests,
            concurrency: 3,
            model: "openai/gpt-4o-mini".into(),
            failure_rate: 0.0,
            latency_ms: 1,
            export: false,
        }
    }

    #[tokio::test]
    async fn every_run_is_traced_and_billed() {
        let engine = Arc::new(TelemetryEngine::from_config(TelemetryConfig::default(), vec![], vec![]).unwrap());
        let provider = Arc::new(SimulatedProvider::new(0.0, Duration::from_millis(1)));

        let outcome = simulate(&engine, provider, &args(7)).await;
        assert_eq!(outcome.succeeded, 7);
        assert_eq!(engine.costs().ledger().len(), 7);
        assert!(engine.costs().spent() > 0.0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn failing_provider_is_counted_not_fatal() {
        let engine = Arc::new(TelemetryEngine::from_config(TelemetryConfig::default(), vec![], vec![]).unwrap());
        let provider = Arc::new(SimulatedProvider::new(1.0, Duration::from_millis(1)));

        let outcome = simulate(&engine, provider, &args(4)).await;
        assert_eq!(outcome.failed, 4);
        assert!(engine.costs().ledger().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn tiny_budget_refuses_later_runs() {
        let config = TelemetryConfig {
            budget: Some(BudgetConfig {
                threshold: 1e-9,
                currency: "USD".into(),
                on_exceed: BudgetAction::Deny,
            }),
            ..TelemetryConfig::default()
        };
        let engine = Arc::new(TelemetryEngine::from_config(config, vec![], vec![]).unwrap());
        let provider = Arc::new(SimulatedProvider::new(0.0, Duration::from_millis(1)));

        let mut single = args(5);
        single.concurrency = 1;
        let outcome = simulate(&engine, provider, &single).await;
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.refused, 4);
        engine.shutdown().await;
    }
}
