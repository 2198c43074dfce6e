//! `check-config`: load, validate and summarize a config file.

use std::path::Path;

use llmscope_config::TelemetryConfig;

pub fn run(path: &Path, print_default: bool) -> Result<(), Box<dyn std::error::Error>> {
    if print_default {
        print!("{}", TelemetryConfig::default_toml());
        return Ok(());
    }

    let config = TelemetryConfig::load_from(path)?;
    let source = if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, defaults)", path.display())
    };

    println!("✅ Config OK: {source}");
    println!("─────────────────────────────────────");
    for line in summary(&config) {
        println!("  {line}");
    }
    Ok(())
}

fn summary(config: &TelemetryConfig) -> Vec<String> {
    let export = &config.export;
    let metrics = &config.metrics;
    let mut lines = vec![
        format!("Sampling rate:   {}", config.sampling_rate),
        format!(
            "Export queue:    {} items, {} on overflow",
            export.queue_capacity, export.backpressure
        ),
        format!(
            "Export batches:  {} items, every {}ms, {} attempts",
            export.batch_size, export.flush_interval_ms, export.max_attempts
        ),
        format!(
            "Metric windows:  every {}ms or {} samples, quantiles {:?} (±{})",
            metrics.flush_interval_ms,
            metrics.max_samples_per_window,
            metrics.quantiles,
            metrics.relative_error
        ),
    ];
    match &config.budget {
        Some(budget) => lines.push(format!(
            "Budget:          {:.4} {} ({:?} when exceeded)",
            budget.threshold, budget.currency, budget.on_exceed
        )),
        None => lines.push("Budget:          none".to_string()),
    }
    if !config.pricing.is_empty() {
        lines.push(format!("Price overrides: {}", config.pricing.len()));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmscope_config::BudgetConfig;

    #[test]
    fn summary_mentions_budget() {
        let mut config = TelemetryConfig::default();
        assert!(summary(&config).iter().any(|l| l.contains("none")));

        config.budget = Some(BudgetConfig {
            threshold: 25.0,
            currency: "EUR".into(),
            on_exceed: Default::default(),
        });
        assert!(summary(&config).iter().any(|l| l.contains("25.0000 EUR")));
    }
}
