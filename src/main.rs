/*!
 * fileflow CLI - Command Line Interface
 *
 * Runs a pipeline described in a TOML file, or only checks that file.
 */

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use fileflow::{
    config::PipelineConfig,
    error::{FlowError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    pipeline::{Pipeline, PipelineReport},
};

#[derive(Parser)]
#[command(name = "fileflow")]
#[command(version, about = "Streaming file ingestion with bounded memory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline described in CONFIG
    Run {
        /// Pipeline configuration (TOML)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Verbose output (debug level logging)
        #[arg(short = 'v', long)]
        verbose: bool,

        /// Write JSON logs to this file instead of stderr
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check CONFIG without running anything
    Validate {
        /// Pipeline configuration (TOML)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<FlowError>()
                .map(FlowError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn load(path: &Path) -> anyhow::Result<PipelineConfig> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid pipeline in {}", path.display()))?;
    Ok(config)
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let pipeline = load(&config)?;
            let kinds: Vec<&str> = pipeline.stages.iter().map(|s| s.kind()).collect();
            println!("{}: ok ({})", config.display(), kinds.join(" -> "));
            Ok(EXIT_SUCCESS)
        }
        Commands::Run {
            config,
            verbose,
            log_file,
            json,
        } => {
            let mut pipeline_config = load(&config)?;
            if verbose {
                pipeline_config.logging.verbose = true;
            }
            if log_file.is_some() {
                pipeline_config.logging.log_file = log_file;
            }
            logging::init_logging(&pipeline_config.logging)?;

            let report = Pipeline::from_config(&pipeline_config)?.run()?;
            print_report(&report, json)?;
            Ok(report.exit_code())
        }
    }
}

fn print_report(report: &PipelineReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Pipeline finished in {} ms", report.duration_ms);
    for stage in &report.stages {
        print!(
            "  {:<12} emitted {:>6}  dropped {:>4}",
            stage.stage, stage.items_emitted, stage.counters.items_dropped
        );
        if stage.counters.memory_pauses > 0 {
            print!("  memory pauses {}", stage.counters.memory_pauses);
        }
        println!();
    }
    if report.trailing_items > 0 {
        println!("  {} items left the last stage unconsumed", report.trailing_items);
    }
    Ok(())
}
