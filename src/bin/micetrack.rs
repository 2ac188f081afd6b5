use anyhow::{Context, Result};
use clap::Parser;
use micetrack::{
    analysis::{roi_occupancy, MovementSummary},
    visualization, BackgroundModel, CancelToken, FramePipeline, FrameSource, RoiCollection,
    RoiPreset, TorchModel, TrackingConfig, VideoFile,
};
use opencv::{core::Size, prelude::*, videoio::VideoWriter};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "micetrack",
    about = "Rodent tracking: per-frame detection with background-subtraction fallback",
    version = "0.1.0"
)]
struct Args {
    /// Path to the input video
    #[arg(short, long, required = true)]
    input: PathBuf,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// ROI preset JSON (optional; without it no ROI classification happens)
    #[arg(short, long)]
    rois: Option<PathBuf>,

    /// Path to model weights (overrides the config)
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Output JSON path for tracking results
    #[arg(short, long, default_value = "tracking_results.json")]
    output: PathBuf,

    /// Write an annotated copy of the video next to the results
    #[arg(long)]
    annotate: Option<PathBuf>,

    /// Sample the background only from the middle half of the video,
    /// skipping the first and last quarter
    #[arg(long)]
    trim_background_window: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("micetrack=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = TrackingConfig::from_file(
        args.config
            .to_str()
            .context("config path is not valid UTF-8")?,
    )?;
    if let Some(weights) = &args.weights {
        config.model_path = weights.to_string_lossy().to_string();
    }

    let rois = match &args.rois {
        Some(path) => {
            let preset = RoiPreset::from_file(path)?;
            info!(
                preset = %preset.preset_name,
                rois = preset.rois.len(),
                "loaded ROI preset"
            );
            preset.into_collection()
        }
        None => RoiCollection::new(),
    };

    let input = args
        .input
        .to_str()
        .context("input path is not valid UTF-8")?;

    // Background estimation is a pre-pass over its own capture; tracking
    // re-opens the video from frame zero afterwards.
    let background = {
        let mut source = VideoFile::open(input)?;
        let window = if args.trim_background_window {
            let total = source.frame_count();
            Some(total / 4..total - total / 4)
        } else {
            None
        };
        match BackgroundModel::estimate(&mut source, config.background_samples, window) {
            Ok(model) => {
                info!(samples = model.sample_count(), "background model ready");
                Some(model)
            }
            Err(e) => {
                warn!("background unavailable, running primary-only: {e}");
                None
            }
        }
    };

    let model = TorchModel::load(
        &config.model_path,
        config.resolved_model_kind(),
        &config.device,
        (config.input_size[0], config.input_size[1]),
        config.conf_threshold,
        config.iou_threshold,
    )?;
    info!(model = %config.model_path, kind = ?config.resolved_model_kind(), "model loaded");

    let mut source = VideoFile::open(input)?;
    let mut pipeline = FramePipeline::new(Box::new(model), background, rois)
        .with_fallback_threshold(config.fallback_threshold);

    let result = pipeline.run(&mut source, &CancelToken::new())?;

    let movement = MovementSummary::from_records(&result.frames);
    info!(
        total_distance = movement.total_distance,
        average_velocity = movement.average_velocity,
        "movement summary"
    );
    for (name, frames) in roi_occupancy(&result.frames) {
        info!(roi = %name, frames, "occupancy");
    }

    let json = serde_json::to_string_pretty(&result)?;
    fs::write(&args.output, json)?;
    info!(output = %args.output.display(), "results written");

    if let Some(annotate_path) = &args.annotate {
        write_annotated_video(input, annotate_path, &result)?;
        info!(output = %annotate_path.display(), "annotated video written");
    }

    Ok(())
}

/// Re-read the video and overlay ROIs, the per-frame position, and a short
/// trajectory trail.
fn write_annotated_video(
    input: &str,
    output: &PathBuf,
    result: &micetrack::TrackingResult,
) -> Result<()> {
    let mut source = VideoFile::open(input)?;
    let (width, height) = source.frame_size();

    let fourcc = VideoWriter::fourcc('a', 'v', 'c', '1')?;
    let mut writer = VideoWriter::new(
        &output.to_string_lossy(),
        fourcc,
        source.fps(),
        Size::new(width, height),
        true,
    )?;
    if !writer.is_opened()? {
        anyhow::bail!("could not open video writer for {:?}", output);
    }

    let mut frame_number = 0usize;
    while let Some(mut frame) = source.read_next()? {
        visualization::draw_rois(&mut frame, &result.rois)?;
        visualization::draw_trail(&mut frame, &result.frames[..frame_number.min(result.frames.len())], 60)?;

        if let Some(record) = result.frames.get(frame_number) {
            if let Some(position) = record.position {
                visualization::draw_position(&mut frame, position)?;
            }
            if let Some(micetrack::detection::CandidatePayload::Keypoints { keypoints }) =
                &record.payload
            {
                visualization::draw_keypoints(&mut frame, keypoints)?;
            }
            let method = match record.method {
                micetrack::pipeline::DetectionMethod::Primary => "primary",
                micetrack::pipeline::DetectionMethod::Fallback => "fallback",
                micetrack::pipeline::DetectionMethod::None => "none",
            };
            visualization::draw_frame_info(&mut frame, frame_number, method)?;
        }

        writer.write(&frame)?;
        frame_number += 1;
    }

    Ok(())
}
