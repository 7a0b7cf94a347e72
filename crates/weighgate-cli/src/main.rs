use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weighgate_core::{FaceOutcome, Precision, QualityReport};
use weighgate_plate::PlateGrammar;

mod config;
mod engine;
mod gallery;

use config::Config;
use gallery::VehicleRegistry;

#[derive(Parser)]
#[command(name = "weighgate", about = "Operator and vehicle recognition for weigh-station access")]
struct Cli {
    /// TOML configuration file (WEIGHGATE_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Width {
    F32,
    F64,
}

impl From<Width> for Precision {
    fn from(w: Width) -> Self {
        match w {
            Width::F32 => Precision::F32,
            Width::F64 => Precision::F64,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a photo holds exactly one usable face
    Assess {
        image: PathBuf,
    },
    /// Enroll an operator from a face photo
    Enroll {
        /// Identity handle the embedding is stored under
        #[arg(long)]
        handle: String,
        /// Gallery directory
        #[arg(short, long)]
        gallery: PathBuf,
        /// Component width of the stored embedding
        #[arg(long, value_enum, default_value = "f32")]
        precision: Width,
        image: PathBuf,
    },
    /// Compare a face photo against one enrolled operator
    Verify {
        #[arg(long)]
        handle: String,
        #[arg(short, long)]
        gallery: PathBuf,
        image: PathBuf,
    },
    /// Search the gallery for the operator in a face photo
    Identify {
        #[arg(short, long)]
        gallery: PathBuf,
        image: PathBuf,
    },
    /// Read a plate from one or more frames of the same vehicle
    Plate {
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Identify the operator and the vehicle together
    Recognize {
        /// Operator face photo
        #[arg(long)]
        face: PathBuf,
        #[arg(short, long)]
        gallery: PathBuf,
        /// JSON object mapping plate text to vehicle handle
        #[arg(short, long)]
        registry: Option<PathBuf>,
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct Enrolled {
    handle: String,
    path: PathBuf,
    quality: QualityReport,
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

fn load_frames(paths: &[PathBuf]) -> Result<Vec<image::RgbImage>> {
    paths.iter().map(|p| gallery::load_image(p)).collect()
}

fn load_registry(path: Option<&Path>, grammar: &PlateGrammar) -> Result<VehicleRegistry> {
    match path {
        Some(path) => VehicleRegistry::load(path, grammar),
        None => Ok(VehicleRegistry::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let engine = engine::spawn_engine(&config)?;
    let pretty = cli.pretty;

    match cli.command {
        Commands::Assess { image } => {
            let outcome = engine.assess(gallery::load_image(&image)?).await?;
            emit(&outcome, pretty)?;
        }
        Commands::Enroll {
            handle,
            gallery: dir,
            precision,
            image,
        } => {
            let outcome = engine.extract(gallery::load_image(&image)?).await?;
            let face = match outcome {
                FaceOutcome::Accepted(face) => face,
                FaceOutcome::Rejected(miss) => {
                    emit(&FaceOutcome::<()>::Rejected(miss.clone()), pretty)?;
                    bail!("enrollment rejected: {miss}");
                }
            };
            let path = gallery::save_embedding(&dir, &handle, &face.embedding, precision.into())?;
            emit(
                &Enrolled {
                    handle,
                    path,
                    quality: face.quality,
                },
                pretty,
            )?;
        }
        Commands::Verify {
            handle,
            gallery: dir,
            image,
        } => {
            let reference = gallery::load_record(&dir, &handle)?;
            let outcome = engine.verify(gallery::load_image(&image)?, reference).await?;
            emit(&outcome, pretty)?;
        }
        Commands::Identify { gallery: dir, image } => {
            let entries = gallery::load_gallery(&dir)?;
            let outcome = engine.identify(gallery::load_image(&image)?, entries).await?;
            emit(&outcome, pretty)?;
        }
        Commands::Plate { frames } => {
            let report = engine.plate(load_frames(&frames)?).await?;
            emit(&report, pretty)?;
        }
        Commands::Recognize {
            face,
            gallery: dir,
            registry,
            frames,
        } => {
            let grammar = PlateGrammar::new(&config.plate.pattern)?;
            let registry = load_registry(registry.as_deref(), &grammar)?;
            let entries = gallery::load_gallery(&dir)?;
            let result = engine
                .recognize(
                    gallery::load_image(&face)?,
                    load_frames(&frames)?,
                    entries,
                    Arc::new(registry),
                )
                .await?;
            emit(&result, pretty)?;
        }
    }

    Ok(())
}
