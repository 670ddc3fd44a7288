use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::Parser;

use framesight_core::detection::domain::detector::Detector;
use framesight_core::detection::domain::engine_config::{FaceMeshConfig, ObjectDetectorConfig};
use framesight_core::detection::infrastructure::engine_factory::{create_engine, ENGINE_NAMES};
use framesight_core::detection::infrastructure::face_mesh_engine::FaceMeshEngine;
use framesight_core::detection::infrastructure::yolo_object_detector::YoloObjectDetector;
use framesight_core::pipeline::analysis_pool::{AnalysisPool, WorkerFactory};
use framesight_core::pipeline::frame_worker::{FrameRecord, FrameWorker};
use framesight_core::shared::constants::ENV_THROTTLE_INTERVAL;
use framesight_core::video::domain::video_reader::VideoReader;
use framesight_core::video::infrastructure::ffmpeg_reader::FfmpegReader;

type SendError = Box<dyn std::error::Error + Send + Sync>;

/// Multi-backend face and object detection for videos.
///
/// Analyzes a video with the selected engine and writes one JSON line
/// per frame record.
#[derive(Parser)]
#[command(name = "framesight")]
struct Cli {
    /// Input video file.
    input: Option<PathBuf>,

    /// Detection engine (see --list-engines).
    #[arg(long, default_value = "mediapipe")]
    engine: String,

    /// Enable GPU execution providers.
    #[arg(long)]
    gpu: bool,

    /// Run expensive detector stages every Nth frame (1 = every frame).
    #[arg(long)]
    throttle: Option<usize>,

    /// Number of parallel analysis workers.
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Also run the secondary object detector on every frame.
    #[arg(long)]
    objects: bool,

    /// Write JSON lines to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the engine names the factory accepts and exit.
    #[arg(long)]
    list_engines: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.list_engines {
        for name in ENGINE_NAMES {
            println!("{name}");
        }
        return Ok(());
    }

    validate(&cli)?;
    let Some(input) = cli.input.clone() else {
        return Err("Input video file is required".into());
    };

    // Engine configs collect the throttle interval from the environment;
    // the flag overrides it for the whole process before workers start.
    if let Some(n) = cli.throttle {
        std::env::set_var(ENV_THROTTLE_INTERVAL, n.to_string());
    }

    let mut probe: Box<dyn VideoReader> = Box::new(FfmpegReader::new());
    let metadata = probe.open(&input)?;
    probe.close();
    log::info!(
        "{}x{} @ {:.2} fps, {} frames ({})",
        metadata.width,
        metadata.height,
        metadata.fps,
        metadata.total_frames,
        metadata.codec
    );

    let engine_name = cli.engine.clone();
    let use_gpu = cli.gpu;
    let with_objects = cli.objects;
    let make_worker: Box<WorkerFactory> = Box::new(move || {
        let engine: Box<dyn Detector> = match create_engine(&engine_name, use_gpu)? {
            Some(engine) => engine,
            None => {
                let mut config = FaceMeshConfig::from_env();
                config.use_gpu = use_gpu;
                let engine = FaceMeshEngine::from_config(&config)
                    .map_err(|e| -> SendError { e.to_string().into() })?;
                Box::new(engine)
            }
        };

        let secondary: Option<Box<dyn Detector>> = if with_objects {
            let mut config = ObjectDetectorConfig::from_env();
            config.use_gpu = use_gpu;
            let detector = YoloObjectDetector::from_config(&config)
                .map_err(|e| -> SendError { e.to_string().into() })?;
            Some(Box::new(detector))
        } else {
            None
        };

        Ok(FrameWorker::new(
            Box::new(FfmpegReader::new()),
            engine,
            secondary,
        ))
    });

    let started = Instant::now();
    let pool = AnalysisPool::new(cli.workers);
    let records = pool.analyze(&input, metadata.total_frames, &*make_worker)?;

    let detections: usize = records.iter().map(|r| r.detections.len()).sum();
    write_records(&records, cli.output.as_deref())?;

    log::info!(
        "analyzed {} frames, {} detections, {:.2}s elapsed",
        records.len(),
        detections,
        started.elapsed().as_secs_f64()
    );

    Ok(())
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(input) = &cli.input {
        if !input.exists() {
            return Err(format!("Input file not found: {}", input.display()).into());
        }
    }

    let normalized = cli.engine.trim().to_ascii_lowercase();
    if !ENGINE_NAMES.contains(&normalized.as_str()) {
        return Err(format!("Unknown engine '{normalized}'; use --list-engines").into());
    }

    if cli.workers == 0 {
        return Err("Workers must be at least 1".into());
    }

    if let Some(n) = cli.throttle {
        if n == 0 {
            return Err("Throttle interval must be at least 1".into());
        }
    }

    Ok(())
}

fn write_records(
    records: &[FrameRecord],
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    if let Some(path) = output {
        log::info!("Records written to {}", path.display());
    }
    Ok(())
}
