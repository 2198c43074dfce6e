//! llmscope CLI: operator surface for the telemetry engine.
//!
//! Commands:
//! - `check-config`: Load and validate a config file
//! - `pricing`: Show the effective model price table
//! - `simulate`: Drive synthetic LLM pipelines through the engine

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "llmscope",
    about = "llmscope: trace, meter and budget LLM pipelines",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults apply when it does not exist)
    #[arg(short, long, global = true, env = "LLMSCOPE_CONFIG", default_value = "llmscope.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and print the effective settings
    CheckConfig {
        /// Print a default config instead
        #[arg(long)]
        print_default: bool,
    },

    /// Show per-model prices, including config overrides
    Pricing {
        /// Price a call: model id
        #[arg(long)]
        model: Option<String>,

        #[arg(long, default_value_t = 0)]
        input_tokens: u64,

        #[arg(long, default_value_t = 0)]
        output_tokens: u64,
    },

    /// Run synthetic pipelines through the telemetry engine
    Simulate(commands::simulate::SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so exported JSON lines on stdout stay clean.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig { print_default } => {
            commands::check_config::run(&cli.config, print_default)?
        }
        Commands::Pricing {
            model,
            input_tokens,
            output_tokens,
        } => commands::pricing::run(&cli.config, model.as_deref(), input_tokens, output_tokens)?,
        Commands::Simulate(args) => commands::simulate::run(&cli.config, args).await?,
    }

    Ok(())
}
