use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use common::types::{ImageBuffer, ProcessingOptions, QualityLevel};
use common::utils::{format_bytes, format_duration};
use config::ConfigManager;
use hardware_profiler::{CapabilityProbe, TierAssigner, TierCatalog};
use logging::{init_logging, LogFormat, LoggingOptions};
use sketch_orchestrator::{load_catalog, SketchOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "sketch-orchestrator", version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive; overrides `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the detected capabilities
    Probe,
    /// List the tiers and mark the one assigned to this host
    Tiers,
    /// Run the micro-benchmarks and print the recommendation
    Benchmark,
    /// List the styles and their fallback chains
    Styles,
    /// Turn an image into a sketch
    Process {
        /// Style id
        #[arg(short, long)]
        style: String,

        /// Raw RGBA8 input; a test pattern is used when absent
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Raw RGBA8 output
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = "256")]
        width: u32,

        #[arg(long, default_value = "256")]
        height: u32,

        /// Quality override (low, medium, high, ultra)
        #[arg(short, long)]
        quality: Option<QualityLevel>,

        #[arg(long, default_value = "0.5")]
        intensity: f32,

        /// Draw light strokes on dark
        #[arg(long)]
        no_invert: bool,

        /// Run the benchmark before processing
        #[arg(long)]
        benchmark: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = Arc::new(match &cli.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    });

    let mut logging = LoggingOptions::from_config(&config_manager)?;
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.json_logs {
        logging.format = LogFormat::Json;
    }
    let _guard = init_logging(&logging)?;

    match cli.command {
        Command::Probe => {
            let snapshot = CapabilityProbe::new(config_manager).detect();
            print_json(&snapshot)?;
        }
        Command::Tiers => list_tiers(&config_manager)?,
        Command::Benchmark => {
            let orchestrator = SketchOrchestrator::builder(config_manager)
                .benchmark_on_startup(false)
                .build()
                .await?;
            let result = orchestrator.run_benchmark().await?;
            print_json(&result)?;
            orchestrator.shutdown().await;
        }
        Command::Styles => list_styles(&config_manager)?,
        Command::Process {
            style,
            input,
            output,
            width,
            height,
            quality,
            intensity,
            no_invert,
            benchmark,
        } => {
            let mut builder = SketchOrchestrator::builder(config_manager);
            if benchmark {
                builder = builder.benchmark_on_startup(true);
            }
            let orchestrator = builder.build().await?;
            orchestrator.start_monitoring();

            let image = match input {
                Some(path) => read_raw_image(&path, width, height)?,
                None => test_pattern(width, height)?,
            };
            let options = ProcessingOptions {
                quality,
                intensity,
                invert: !no_invert,
            };

            let outcome = orchestrator.process(image, &style, options).await;
            orchestrator.shutdown().await;
            let result = outcome?;

            info!(
                "'{}' served by {} as '{}' in {}",
                result.original_style,
                result.engine_used,
                result.style_used,
                format_duration(result.elapsed)
            );
            if let Some(path) = output {
                std::fs::write(&path, result.image.pixels())
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(
                    "Wrote {}x{} RGBA ({}) to {}",
                    result.image.width(),
                    result.image.height(),
                    format_bytes(result.image.pixels().len() as u64),
                    path.display()
                );
            }
            print_json(&result)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_tiers(config_manager: &Arc<ConfigManager>) -> Result<()> {
    let catalog = load_catalog(config_manager)?;
    let tiers = Arc::new(TierCatalog::new(catalog.tiers)?);
    let snapshot = CapabilityProbe::new(config_manager.clone()).detect();
    let assigned = TierAssigner::new(tiers.clone()).assign(&snapshot).id.clone();

    for tier in tiers.tiers() {
        let marker = if tier.id == assigned { "*" } else { " " };
        println!(
            "{} {:<10} {:<32} models={} max_model={} cache={} quality={} engine={}",
            marker,
            tier.id,
            tier.name,
            tier.budget.max_models,
            format_bytes(tier.budget.max_model_bytes),
            format_bytes(tier.budget.cache_byte_budget),
            tier.budget.quality_level,
            tier.preferred_engine
        );
    }
    Ok(())
}

fn list_styles(config_manager: &ConfigManager) -> Result<()> {
    let catalog = load_catalog(config_manager)?;
    let styles = orchestrator_core::StyleCatalog::new(catalog.styles)?;
    for entry in styles.entries() {
        let chain: Vec<&str> = styles.chain(&entry.id)?.iter().map(|s| s.id.as_str()).collect();
        println!("{:<16} engine={:<14} chain={}", entry.id, entry.engine, chain.join(" -> "));
    }
    Ok(())
}

fn read_raw_image(path: &Path, width: u32, height: u32) -> Result<ImageBuffer> {
    let pixels = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected {
        bail!(
            "{} holds {} bytes, expected {} for {}x{} RGBA",
            path.display(),
            pixels.len(),
            expected,
            width,
            height
        );
    }
    Ok(ImageBuffer::new(width, height, pixels)?)
}

/// Diagonal gradient with a dark disc, enough edges to see every style work
fn test_pattern(width: u32, height: u32) -> Result<ImageBuffer> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = width.min(height) as f32 / 4.0;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let gradient = ((x + y) * 255 / (width + height).max(1)) as u8;
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let value = if dx * dx + dy * dy < radius * radius { 40 } else { gradient };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    Ok(ImageBuffer::new(width, height, pixels)?)
}
