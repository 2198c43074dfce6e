//! `pricing`: list model prices or price a single call.

use std::path::Path;

use llmscope_config::TelemetryConfig;
use llmscope_telemetry::PricingTable;

pub fn run(
    path: &Path,
    model: Option<&str>,
    input_tokens: u64,
    output_tokens: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = TelemetryConfig::load_from(path)?;
    let table = PricingTable::from_overrides(&config.pricing);

    if let Some(model) = model {
        match table.compute_cost(model, input_tokens, output_tokens) {
            Some(cost) => println!(
                "{model}: {input_tokens} in + {output_tokens} out = ${cost:.6}"
            ),
            None => println!("{model}: no price known"),
        }
        return Ok(());
    }

    println!("💰 Model Pricing (per 1M tokens)");
    println!("─────────────────────────────────────────────────────");
    println!("{:<40} {:>10} {:>10}", "Model", "Input", "Output");
    for (name, p) in table.entries() {
        let marker = if config.pricing.contains_key(&name) { " *" } else { "" };
        println!(
            "{:<40} ${:>8.3} ${:>8.3}{marker}",
            name, p.input_per_m, p.output_per_m
        );
    }
    if !config.pricing.is_empty() {
        println!();
        println!("  * overridden in {}", path.display());
    }
    Ok(())
}
