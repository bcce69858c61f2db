use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use pose_transfer_core::{
    ErrorKind, HostEngine, Pipeline, PipelineConfig, PipelineFailure, PipelineInputs,
    PipelineReport, PreviewOutcome, Settings, Stage,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    remember_paths(&cli);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[error] configuration: {err}");
            return ExitCode::from(1);
        }
    };

    let inputs = PipelineInputs {
        source_pose: cli.source_pose.clone(),
        target_avatar: cli.target_avatar.clone(),
        output_dir: cli.output_dir.clone(),
        output_name: cli.output_name.clone(),
    };
    tracing::info!(
        source = %inputs.source_pose.display(),
        target = %inputs.target_avatar.display(),
        engine = %cli.engine.display(),
        "starting pose transfer"
    );

    let engine = Arc::new(HostEngine::new(&cli.engine));
    let mut pipeline = Pipeline::new(engine, inputs, config);
    if cli.skip_preview {
        pipeline = pipeline.without_preview();
    }

    match pipeline.spawn().join() {
        Ok(report) => report_success(&report),
        Err(failure) => report_failure(&failure),
    }
}

fn load_config(cli: &Cli) -> pose_transfer_core::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(secs) = cli.timeout {
        config.engine.timeout_secs = Some(secs);
    }
    Ok(config)
}

fn report_success(report: &PipelineReport) -> ExitCode {
    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    println!("{}", report.export_path.display());
    if let PreviewOutcome::Rendered(path) = &report.preview {
        println!("{}", path.display());
    }
    match success_exit(report) {
        Some((line, code)) => {
            eprintln!("{line}");
            ExitCode::from(code)
        }
        None => ExitCode::SUCCESS,
    }
}

fn report_failure(failure: &PipelineFailure) -> ExitCode {
    let (line, code) = failure_exit(failure);
    eprintln!("{line}");
    ExitCode::from(code)
}

/// Marker and exit code for each failure class.
fn failure_marker(kind: ErrorKind) -> (&'static str, u8) {
    match kind {
        ErrorKind::MissingRig => ("[missing-rig]", 2),
        ErrorKind::ExportFailed => ("[export-failed]", 3),
        ErrorKind::PreviewRender => ("[preview-failed]", 4),
        ErrorKind::ExternalToolInvocation => ("[tool-error]", 5),
        ErrorKind::ExternalToolTimeout => ("[tool-timeout]", 6),
        ErrorKind::SettingsIo
        | ErrorKind::InvalidSkeleton
        | ErrorKind::Cancelled
        | ErrorKind::Other => ("[error]", 1),
    }
}

fn failure_exit(failure: &PipelineFailure) -> (String, u8) {
    let (marker, code) = failure_marker(failure.kind());
    (format!("{marker} {}: {}", failure.stage, failure.error), code)
}

/// A run that exported but could not render its preview still fails with
/// the preview marker, whatever stopped the renderer.
fn success_exit(report: &PipelineReport) -> Option<(String, u8)> {
    match &report.preview {
        PreviewOutcome::Failed(err) => {
            let (marker, code) = failure_marker(ErrorKind::PreviewRender);
            Some((format!("{marker} {}: {err}", Stage::RenderingPreview), code))
        }
        PreviewOutcome::Rendered(_) | PreviewOutcome::Skipped => None,
    }
}

/// Stores the paths of this run for next time. Failures are logged only.
fn remember_paths(cli: &Cli) {
    let Some(path) = &cli.settings else {
        return;
    };
    let mut settings = Settings::load(path);
    settings.pose_path = Some(display(&cli.source_pose));
    settings.avatar_path = Some(display(&cli.target_avatar));
    settings.export_dir = Some(display(&cli.output_dir));
    settings.engine_path = Some(display(&cli.engine));
    settings.output_name = Some(cli.output_name.clone());
    if let Err(err) = settings.save(path) {
        tracing::warn!(%err, "could not persist settings");
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Copy a pose from one rig onto another and export it",
    long_about = None
)]
struct Cli {
    /// Scene file holding the posed source rig.
    source_pose: PathBuf,
    /// Scene file holding the avatar that receives the pose.
    target_avatar: PathBuf,
    /// Directory the exported file and preview are written to.
    output_dir: PathBuf,
    /// Path to the headless engine executable.
    engine: PathBuf,
    /// Base name of the exported file and preview, without extension.
    output_name: String,
    /// Optional JSON pipeline configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Seconds a single engine call may take; 0 disables the limit.
    #[arg(long)]
    timeout: Option<u64>,
    /// JSON file remembering the paths of the last run.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Export only, without rendering a preview image.
    #[arg(long)]
    skip_preview: bool,
}
