use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meadowlark_core::{InvestmentHorizon, InvestmentPreferences, PipelineOutput, Region, RiskTolerance};
use meadowlark_enrich::FallbackSynthesizer;
use meadowlark_ingest::load_response_fixture;
use meadowlark_pipeline::{Orchestrator, PipelineConfig};
use meadowlark_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meadowlark")]
#[command(about = "Meadowlark conservation investment finder")]
struct Cli {
    /// YAML settings file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Request, ingest and enrich opportunities for the given preferences
    Run(PreferenceArgs),
    /// Ingest a saved generation response and print the canonical records
    Parse { file: PathBuf },
    /// Print the offline fallback opportunities
    Fallback(PreferenceArgs),
    Serve {
        #[arg(long, env = "MEADOWLARK_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Debug, Args)]
struct PreferenceArgs {
    /// JSON preferences document (camelCase keys); overrides the flags below
    #[arg(long)]
    preferences: Option<PathBuf>,
    #[arg(long, default_value = "south-america")]
    region: Region,
    #[arg(long, default_value_t = 50_000.0)]
    amount: f64,
    #[arg(long, value_delimiter = ',', default_values_t = [13u8, 15])]
    sdgs: Vec<u8>,
    #[arg(long, default_value = "medium")]
    risk: RiskTolerance,
    #[arg(long, default_value = "medium")]
    horizon: InvestmentHorizon,
    #[arg(long, default_value_t = 5.0)]
    min_return: f64,
}

impl PreferenceArgs {
    fn resolve(self) -> Result<InvestmentPreferences> {
        if let Some(path) = self.preferences {
            return read_json_file(&path);
        }
        Ok(InvestmentPreferences {
            region: self.region,
            investment_amount: self.amount,
            sdgs: self.sdgs,
            risk_tolerance: self.risk,
            investment_horizon: self.horizon,
            minimum_return: self.min_return,
        })
    }
}

fn read_json_file(path: &Path) -> Result<InvestmentPreferences> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_yaml_file(path),
        None => Ok(PipelineConfig::from_env()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("meadowlark=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            let preferences = args.resolve()?;
            let orchestrator = Orchestrator::from_config(&config)?;
            let report = orchestrator.run(&preferences).await;
            info!(
                run_id = %report.run_id,
                state = ?report.terminal_state(),
                records = report.output.opportunities.len(),
                "run complete"
            );
            print_json(&report.output)?;
        }
        Commands::Parse { file } => {
            let raw = load_response_fixture(&file)?;
            let orchestrator = Orchestrator::from_config(&config)?;
            let collection = orchestrator
                .parse_only(&raw)
                .with_context(|| format!("ingesting {}", file.display()))?;
            print_json(&collection)?;
        }
        Commands::Fallback(args) => {
            let preferences = args.resolve()?;
            print_json(&PipelineOutput {
                opportunities: FallbackSynthesizer::synthesize(&preferences),
                used_fallback: true,
                error_detail: None,
            })?;
        }
        Commands::Serve { port } => {
            let orchestrator = Orchestrator::from_config(&config)?;
            meadowlark_web::serve(AppState::new(orchestrator), port).await?;
        }
    }

    Ok(())
}
