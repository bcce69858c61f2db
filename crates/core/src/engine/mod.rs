//! Boundary to the external 3D content engine.
//!
//! The pipeline only needs three capabilities from the engine: import a scene
//! file into typed objects, export a selection to an interchange file and
//! render a thumbnail of an exported file. [`Engine`] captures exactly that;
//! [`HostEngine`] implements it by running a headless engine executable with
//! an embedded script and exchanging JSON documents through the run's working
//! directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::export::ExportRequest;
use crate::preview::PreviewRequest;
use crate::process::{CancellationToken, ExternalCommand, ToolOutput};
use crate::scene::{ImportedScene, ObjectKind};
use crate::{PoseTransferError, Result};

const IMPORT_SCRIPT: &str = include_str!("../../scripts/import_scene.py");
const EXPORT_SCRIPT: &str = include_str!("../../scripts/export_scene.py");
const PREVIEW_SCRIPT: &str = include_str!("../../scripts/render_preview.py");

/// Exit status the engine scripts use when the loaded file has no armature.
pub const NO_ARMATURE_EXIT: i32 = 3;

/// Per-run settings shared by every engine call.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub trait Engine: Send + Sync {
    /// Loads `path` into a fresh, empty scene and describes its objects.
    fn import_scene(&self, path: &Path, ctx: &RunContext) -> Result<ImportedScene>;

    /// Writes `request.output`. Failures surface as `ExportFailed`.
    fn export_scene(&self, request: &ExportRequest, ctx: &RunContext) -> Result<()>;

    /// Writes `request.image` from `request.artifact` alone. Failures surface
    /// as `PreviewRender`.
    fn render_preview(&self, request: &PreviewRequest, ctx: &RunContext) -> Result<()>;
}

/// Headless engine executable driven through embedded scripts.
#[derive(Debug)]
pub struct HostEngine {
    executable: PathBuf,
    sequence: AtomicU32,
}

impl HostEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            sequence: AtomicU32::new(0),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn scratch_path(&self, ctx: &RunContext, stem: &str, extension: &str) -> PathBuf {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        ctx.work_dir.join(format!("{stem}-{n}.{extension}"))
    }

    fn write_script(&self, ctx: &RunContext, stem: &str, contents: &str) -> Result<PathBuf> {
        let path = self.scratch_path(ctx, stem, "py");
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn write_document<T: serde::Serialize>(
        &self,
        ctx: &RunContext,
        stem: &str,
        value: &T,
    ) -> Result<PathBuf> {
        let path = self.scratch_path(ctx, stem, "json");
        std::fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        Ok(path)
    }

    fn invoke(&self, ctx: &RunContext, script: &Path, args: &[&Path]) -> Result<ToolOutput> {
        ExternalCommand::new(&self.executable)
            .args(["--background", "--factory-startup", "--python-exit-code", "1", "--python"])
            .arg(script)
            .arg("--")
            .args(args.iter().map(|p| p.as_os_str().to_owned()))
            .current_dir(&ctx.work_dir)
            .run(ctx.timeout, &ctx.cancel)
    }
}

impl Engine for HostEngine {
    fn import_scene(&self, path: &Path, ctx: &RunContext) -> Result<ImportedScene> {
        let script = self.write_script(ctx, "import_scene", IMPORT_SCRIPT)?;
        let document = self.scratch_path(ctx, "scene", "json");

        let output = self.invoke(ctx, &script, &[path, document.as_path()])?;
        if !output.success() {
            return Err(PoseTransferError::ExternalToolInvocation {
                program: output.program.clone(),
                diagnostic: output.diagnostic(),
            });
        }

        let bytes =
            std::fs::read(&document).map_err(|err| PoseTransferError::ExternalToolInvocation {
                program: output.program.clone(),
                diagnostic: format!(
                    "scene description `{}` missing: {err}\n{}",
                    document.display(),
                    output.diagnostic()
                ),
            })?;
        let mut scene: ImportedScene = serde_json::from_slice(&bytes)?;
        scene.source = path.to_path_buf();

        for object in &scene.objects {
            if let ObjectKind::Armature(armature) = &object.kind {
                armature.skeleton.validate()?;
            }
        }
        tracing::debug!(path = %path.display(), objects = scene.objects.len(), "imported scene");
        Ok(scene)
    }

    fn export_scene(&self, request: &ExportRequest, ctx: &RunContext) -> Result<()> {
        let script = self.write_script(ctx, "export_scene", EXPORT_SCRIPT)?;
        let document = self.write_document(ctx, "export_request", request)?;

        let output = self.invoke(ctx, &script, &[document.as_path()])?;
        if !output.success() {
            return Err(PoseTransferError::ExportFailed {
                diagnostic: output.diagnostic(),
            });
        }
        Ok(())
    }

    fn render_preview(&self, request: &PreviewRequest, ctx: &RunContext) -> Result<()> {
        let script = self.write_script(ctx, "render_preview", PREVIEW_SCRIPT)?;
        let document = self.write_document(ctx, "preview_request", request)?;

        let output = self.invoke(ctx, &script, &[document.as_path()])?;
        match output.code {
            Some(0) => Ok(()),
            Some(NO_ARMATURE_EXIT) => Err(PoseTransferError::PreviewRender {
                diagnostic: format!(
                    "no armature found in `{}`\n{}",
                    request.artifact.display(),
                    output.diagnostic()
                ),
            }),
            _ => Err(PoseTransferError::PreviewRender {
                diagnostic: output.diagnostic(),
            }),
        }
    }
}
