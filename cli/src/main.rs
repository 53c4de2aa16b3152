use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use player_core::{
    PipelineError,
    config::{ConfidenceThreshold, PipelineOptions},
    detection::{SharedModel, YoloDetector},
    pipeline::{ImagePipeline, PipelineResult, ProgressFn, VideoPipeline},
    report::RunReport,
    runtime::configure_ort_dylib,
    video::probe,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "player-detect",
    version,
    about = "Detect and label players in images and videos",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// YOLOv8 ONNX model path
    #[arg(long, default_value = "yolov8x.onnx")]
    model: PathBuf,

    /// Minimum confidence (0–1); missing or non-numeric falls back to 0.3
    #[arg(short, long)]
    confidence: Option<String>,

    /// Abort a run that takes longer than this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Annotate a single image.
    Image {
        /// Input image path
        #[arg(short, long, required_unless_present = "data_url")]
        input: Option<PathBuf>,

        /// Read a pasted image from stdin: base64, optionally as a data: URL
        #[arg(long, conflicts_with = "input")]
        data_url: bool,

        /// Embed the annotated JPEG in the report as base64
        #[arg(long)]
        inline_image: bool,

        /// Output JPEG path
        #[arg(short, long, default_value = "annotated.jpg")]
        output: PathBuf,

        /// JPEG quality (1–100)
        #[arg(long, default_value_t = 95)]
        quality: u8,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Annotate every frame of a video.
    Video {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path
        #[arg(short, long, default_value = "annotated.mp4")]
        output: PathBuf,

        /// Report progress every N frames
        #[arg(long, default_value_t = 10)]
        progress_every: u64,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Print stream metadata for a video.
    Probe {
        /// Input video path
        input: PathBuf,
    },

    /// Annotate several images and videos concurrently with one loaded model.
    Batch {
        /// Input media paths
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory for annotated outputs
        #[arg(short, long, default_value = "annotated")]
        output_dir: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Image {
            input,
            data_url,
            inline_image,
            output,
            quality,
            model,
        } => cmd_image(input, data_url, inline_image, output, quality, model),
        Commands::Video {
            input,
            output,
            progress_every,
            model,
        } => cmd_video(input, output, progress_every, model),
        Commands::Probe { input } => cmd_probe(input),
        Commands::Batch {
            inputs,
            output_dir,
            model,
        } => cmd_batch(inputs, output_dir, model),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_image(
    input: Option<PathBuf>,
    data_url: bool,
    inline_image: bool,
    output: PathBuf,
    quality: u8,
    args: ModelArgs,
) -> Result<()> {
    let pasted = if data_url {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read image data from stdin")?;
        info!("image  : <stdin, {} bytes>", text.len());
        Some(text)
    } else {
        None
    };
    if let Some(input) = &input {
        info!("image  : {}", input.display());
    }
    info!("output : {}", output.display());

    let report = match ConfidenceThreshold::parse(args.confidence.as_deref()) {
        Ok(threshold) => {
            let model = load_model(&args.model)?;
            let options = PipelineOptions {
                jpeg_quality: quality,
                ..options_from(&args)
            };
            let pipeline = ImagePipeline::new(model, options);
            let run = match (pasted, input) {
                (Some(text), _) => pipeline.run_data_url(&text, threshold),
                (None, Some(input)) => pipeline.run_path(input, threshold),
                (None, None) => bail!("either --input or --data-url is required"),
            };
            save_image(run, &output, inline_image)
        }
        Err(e) => RunReport::failed(&e),
    };
    emit(&report)
}

fn cmd_video(input: PathBuf, output: PathBuf, progress_every: u64, args: ModelArgs) -> Result<()> {
    info!("video  : {}", input.display());
    info!("output : {}", output.display());

    let report = match ConfidenceThreshold::parse(args.confidence.as_deref()) {
        Ok(threshold) => {
            let model = load_model(&args.model)?;
            let options = PipelineOptions {
                progress_interval: progress_every,
                ..options_from(&args)
            };
            let pb = progress_bar("Annotating video…");
            let pb2 = pb.clone();
            let progress: ProgressFn = Box::new(move |percent| pb2.set_position(percent as u64));

            let report = match VideoPipeline::new(model, options).run(
                &input,
                &output,
                threshold,
                Some(progress),
            ) {
                Ok(result) => RunReport::completed(&result, &result.output),
                Err(e) => RunReport::failed(&e),
            };
            if report.success {
                pb.finish_with_message("Done.");
            } else {
                pb.abandon_with_message("Failed.");
            }
            report
        }
        Err(e) => RunReport::failed(&e),
    };
    emit(&report)
}

fn cmd_probe(input: PathBuf) -> Result<()> {
    let info = probe(&input).with_context(|| format!("failed to probe {}", input.display()))?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_batch(inputs: Vec<PathBuf>, output_dir: PathBuf, args: ModelArgs) -> Result<()> {
    let threshold = ConfidenceThreshold::parse(args.confidence.as_deref())
        .context("invalid confidence threshold")?;
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("could not create {}", output_dir.display()))?;

    let model = load_model(&args.model)?;
    let options = options_from(&args);
    let images = ImagePipeline::new(Arc::clone(&model), options.clone());
    let videos = VideoPipeline::new(model, options.clone());

    info!(jobs = inputs.len(), "batch started");

    // Independent runs; the model serialises inference internally.
    let reports: Vec<RunReport> = inputs
        .par_iter()
        .enumerate()
        .map(|(index, input)| {
            let output = output_dir.join(output_name(index, input, &options));
            if is_video(input, &options) {
                match videos.run(input, &output, threshold, None) {
                    Ok(result) => RunReport::completed(&result, &result.output),
                    Err(e) => RunReport::failed(&e),
                }
            } else {
                save_image(images.run_path(input, threshold), &output, false)
            }
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// The model is loaded once per process and shared by every run.
fn load_model(path: &Path) -> Result<SharedModel> {
    configure_ort_dylib();
    let detector = YoloDetector::load(path)
        .with_context(|| format!("failed to load model: {}", path.display()))?;
    Ok(Arc::new(detector))
}

fn options_from(args: &ModelArgs) -> PipelineOptions {
    PipelineOptions {
        max_run_time: args.timeout_secs.map(Duration::from_secs),
        ..PipelineOptions::default()
    }
}

/// Write a still run's JPEG to `output` and report on it.
fn save_image(
    run: Result<PipelineResult<Vec<u8>>, PipelineError>,
    output: &Path,
    inline_image: bool,
) -> RunReport {
    let result = match run {
        Ok(result) => result,
        Err(e) => return RunReport::failed(&e),
    };
    if let Err(e) = std::fs::write(output, &result.output) {
        return RunReport::failed(&PipelineError::SinkWrite(format!(
            "could not write {}: {e}",
            output.display()
        )));
    }
    let report = RunReport::completed(&result, output);
    if inline_image {
        report.with_inline_image(&result.output)
    } else {
        report
    }
}

fn is_video(path: &Path, options: &PipelineOptions) -> bool {
    options.check_video_extension(path).is_ok()
}

/// Inputs from different directories may share a stem, so the batch position
/// keeps every output name distinct.
fn output_name(index: usize, input: &Path, options: &PipelineOptions) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    if is_video(input, options) {
        format!("{index:03}_{stem}_annotated.mp4")
    } else {
        format!("{index:03}_{stem}_annotated.jpg")
    }
}

fn emit(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if report.success {
        Ok(())
    } else {
        anyhow::bail!("{}", report.message)
    }
}

fn progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{bar:30.green}] {pos:>3}% [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn confidence_is_taken_as_raw_text() {
        let cli = Cli::try_parse_from(["player-detect", "image", "-i", "a.png", "-c", "abc"]).unwrap();
        let Commands::Image { model, .. } = cli.command else {
            panic!("expected image command");
        };
        assert_eq!(model.confidence.as_deref(), Some("abc"));
        assert_eq!(model.model, PathBuf::from("yolov8x.onnx"));
    }

    #[test]
    fn batch_outputs_keep_media_kind() {
        let options = PipelineOptions::default();
        assert_eq!(output_name(0, Path::new("in/match.MOV"), &options), "000_match_annotated.mp4");
        assert_eq!(output_name(1, Path::new("team.png"), &options), "001_team_annotated.jpg");
    }

    #[test]
    fn batch_outputs_never_collide() {
        let options = PipelineOptions::default();
        let inputs = ["a/clip.mp4", "b/clip.mp4", "team.png", "team.jpg", "team.png"];
        let names: std::collections::HashSet<String> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| output_name(i, Path::new(input), &options))
            .collect();
        assert_eq!(names.len(), inputs.len());
    }

    #[test]
    fn pasted_image_replaces_input_path() {
        let cli = Cli::try_parse_from(["player-detect", "image", "--data-url", "--inline-image"]).unwrap();
        let Commands::Image {
            input,
            data_url,
            inline_image,
            ..
        } = cli.command
        else {
            panic!("expected image command");
        };
        assert!(input.is_none() && data_url && inline_image);

        assert!(Cli::try_parse_from(["player-detect", "image"]).is_err());
        assert!(Cli::try_parse_from(["player-detect", "image", "-i", "a.png", "--data-url"]).is_err());
    }
}
