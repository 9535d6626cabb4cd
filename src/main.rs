use anyhow::{Context, Result};
use clap::Parser;
use maskara::engine::{MemoryOffload, OnnxEngine};
use maskara::frames::{FrameSource, ImageDirSource};
use maskara::histogram;
use maskara::prompts::{self, PromptPayload};
use maskara::propagate::{self, PropagationEvent};
use maskara::session::SessionStore;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory of extracted video frames
    #[arg(short, long)]
    video: PathBuf,

    /// JSON file of prompt points (a single point or a list)
    #[arg(short, long)]
    prompts: PathBuf,

    /// Path to the segmentation model (ONNX file)
    /// If not provided, prompts are validated and grouped without inference
    #[arg(long)]
    model: Option<PathBuf>,

    /// Frame index to start propagation at
    #[arg(long, default_value_t = 0)]
    start_frame: usize,

    /// Cap on the number of propagated frames
    #[arg(long)]
    max_frames: Option<usize>,

    /// Compute single-channel (luminance) histograms
    #[arg(long)]
    monochrome: bool,

    /// Write per-frame histograms to this JSON file
    #[arg(long)]
    histograms: Option<PathBuf>,

    /// Write grayscale mask previews for this object id
    #[arg(long)]
    preview_object: Option<u32>,

    /// Directory for mask preview images
    #[arg(long, default_value = "previews")]
    preview_dir: PathBuf,

    /// Offload engine video/state memory to CPU (long videos)
    #[arg(long)]
    offload: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Maskara starting");
    tracing::info!("Video: {}", args.video.display());

    // Load prompts; the payload may be a single point or a list
    let payload: PromptPayload = serde_json::from_slice(
        &fs::read(&args.prompts).context("Failed to read prompts file")?,
    )
    .context("Failed to parse prompts file")?;
    let raw = payload.into_vec();
    tracing::info!("Loaded {} prompt points from {}", raw.len(), args.prompts.display());

    let Some(model_path) = &args.model else {
        // Passthrough mode: validate and group the prompts, no inference
        let source = ImageDirSource::open(&args.video).context("Failed to open frame directory")?;
        let outcome = prompts::ingest(raw, source.properties().frame_count);
        for rejected in &outcome.rejected {
            tracing::warn!("{}", rejected.reason);
        }
        tracing::info!(
            "Running in passthrough mode (no model): {} groups, {} points rejected",
            outcome.groups.len(),
            outcome.rejected.len()
        );
        return Ok(());
    };

    tracing::info!("Loading segmentation model from {}", model_path.display());
    let engine = OnnxEngine::new(model_path).context("Failed to load segmentation model")?;

    let store = SessionStore::new();
    let offload = MemoryOffload {
        video_to_cpu: args.offload,
        state_to_cpu: args.offload,
    };
    let session = store
        .create(&args.video, Box::new(engine), offload)
        .context("Failed to create session")?;
    let props = session.properties();

    let outcome = prompts::ingest(raw, props.frame_count);
    for rejected in &outcome.rejected {
        tracing::warn!("{}", rejected.reason);
    }
    if outcome.groups.is_empty() {
        anyhow::bail!("no valid prompts to submit");
    }

    let submit_start = Instant::now();
    propagate::submit_groups(&session, outcome.groups.values())
        .context("Failed to submit prompts")?;
    tracing::info!(
        "Submitted {} prompt groups in {:.1}ms",
        outcome.groups.len(),
        submit_start.elapsed().as_secs_f64() * 1000.0
    );

    // Propagate on a worker, logging progress every 30 frames
    let propagation_start = Instant::now();
    let events = propagate::spawn_propagation(&session, args.start_frame, args.max_frames, 8)
        .context("Failed to start propagation")?;

    let mut frame_count = 0u64;
    for event in events {
        match event {
            PropagationEvent::Frame { frame_index, .. } => {
                frame_count += 1;
                if frame_count % 30 == 0 {
                    let avg_ms =
                        propagation_start.elapsed().as_secs_f64() * 1000.0 / frame_count as f64;
                    tracing::info!(
                        "Frame {}: avg={:.1}ms, fps={:.1}",
                        frame_index,
                        avg_ms,
                        1000.0 / avg_ms
                    );
                }
            }
            PropagationEvent::Finished { frames_written } => {
                tracing::info!(
                    "Propagation finished: {} frames in {:.1}s",
                    frames_written,
                    propagation_start.elapsed().as_secs_f64()
                );
            }
            PropagationEvent::Failed { error } => {
                return Err(error).context("Propagation failed");
            }
        }
    }

    if let Some(object_id) = args.preview_object {
        fs::create_dir_all(&args.preview_dir)?;
        let masks = session.masks();
        let mut written = 0usize;
        for (frame_index, frame_masks) in masks.frames() {
            if let Some(img) = frame_masks.render_object(object_id) {
                img.save(args.preview_dir.join(format!("mask_{frame_index:05}.png")))?;
                written += 1;
            }
        }
        tracing::info!("Wrote {} mask previews to {}", written, args.preview_dir.display());
    }

    if let Some(out_path) = &args.histograms {
        let hist_start = Instant::now();
        let masks = session.masks();
        let result = histogram::compute(&masks, session.frame_source().as_ref(), args.monochrome);
        if result.is_total_failure() {
            anyhow::bail!("histogram computation failed: frame source unreadable");
        }
        fs::write(out_path, serde_json::to_vec_pretty(&result.to_json())?)
            .context("Failed to write histogram file")?;
        tracing::info!(
            "Histograms for {} frames written to {} in {:.1}ms ({} skipped)",
            result.histograms.len(),
            out_path.display(),
            hist_start.elapsed().as_secs_f64() * 1000.0,
            result.skipped_frames.len()
        );
    }

    store.end(session.id()).context("Failed to end session")?;
    Ok(())
}
