use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tempfile::TempDir;

use crate::bake::{bake_visual_pose, remove_source_rig, BakeSummary, BAKE_FRAME};
use crate::config::PipelineConfig;
use crate::correspondence::CorrespondenceMap;
use crate::engine::{Engine, RunContext};
use crate::error::ErrorKind;
use crate::export::{export_artifact, export_path, ExportRequest};
use crate::preview::{preview_path, render_preview, PreviewRequest};
use crate::process::CancellationToken;
use crate::sanitize::sanitize_metadata;
use crate::scene::{ObjectId, Scene};
use crate::transfer::{transfer_pose, Pose, TransferSummary};
use crate::PoseTransferError;

/// Stages a run moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Importing,
    Retargeting,
    Baking,
    Exporting,
    RenderingPreview,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Importing => "importing",
            Stage::Retargeting => "retargeting",
            Stage::Baking => "baking",
            Stage::Exporting => "exporting",
            Stage::RenderingPreview => "rendering preview",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Importing,
    Retargeting,
    Baking,
    Exporting,
    RenderingPreview,
    Done,
    Error(ErrorKind),
}

impl PipelineState {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Importing => Some(Stage::Importing),
            PipelineState::Retargeting => Some(Stage::Retargeting),
            PipelineState::Baking => Some(Stage::Baking),
            PipelineState::Exporting => Some(Stage::Exporting),
            PipelineState::RenderingPreview => Some(Stage::RenderingPreview),
            _ => None,
        }
    }
}

impl From<Stage> for PipelineState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Importing => PipelineState::Importing,
            Stage::Retargeting => PipelineState::Retargeting,
            Stage::Baking => PipelineState::Baking,
            Stage::Exporting => PipelineState::Exporting,
            Stage::RenderingPreview => PipelineState::RenderingPreview,
        }
    }
}

/// Terminal failure of a run: the stage that failed and why.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PoseTransferError,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug)]
pub enum PreviewOutcome {
    Rendered(PathBuf),
    /// The export is kept; only the thumbnail is missing.
    Failed(PoseTransferError),
    Skipped,
}

#[derive(Debug)]
pub struct PipelineReport {
    pub export_path: PathBuf,
    pub preview: PreviewOutcome,
    pub transfer: TransferSummary,
    pub bake: BakeSummary,
    pub unmatched_bones: Vec<String>,
    pub warnings: Vec<String>,
}

/// Files a run reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineInputs {
    pub source_pose: PathBuf,
    pub target_avatar: PathBuf,
    pub output_dir: PathBuf,
    /// Base name of both artifacts, without extension.
    pub output_name: String,
}

impl PipelineInputs {
    pub fn export_path(&self) -> PathBuf {
        export_path(&self.output_dir, &self.output_name)
    }

    pub fn preview_path(&self) -> PathBuf {
        preview_path(&self.output_dir, &self.output_name)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineFailure>;
}

impl<T> AtStage<T> for crate::Result<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineFailure> {
        self.map_err(|error| PipelineFailure { stage, error })
    }
}

/// Sequences import, retargeting, baking, export and preview for one run.
pub struct Pipeline {
    engine: Arc<dyn Engine>,
    inputs: PipelineInputs,
    config: PipelineConfig,
    render_preview: bool,
    state: Arc<Mutex<PipelineState>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("inputs", &self.inputs)
            .field("config", &self.config)
            .field("render_preview", &self.render_preview)
            .field("state", &self.state())
            .finish()
    }
}

impl Pipeline {
    pub fn new(engine: Arc<dyn Engine>, inputs: PipelineInputs, config: PipelineConfig) -> Self {
        Self {
            engine,
            inputs,
            config,
            render_preview: true,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn without_preview(mut self) -> Self {
        self.render_preview = false;
        self
    }

    pub fn state(&self) -> PipelineState {
        read_state(&self.state)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every stage in order. The first failure ends the run; a preview
    /// failure is reported in the returned report instead.
    pub fn run(&mut self) -> Result<PipelineReport, PipelineFailure> {
        let result = self.run_stages();
        match &result {
            Ok(_) => self.set_state(PipelineState::Done),
            Err(failure) => {
                tracing::error!(stage = %failure.stage, error = %failure.error, "pipeline failed");
                self.set_state(PipelineState::Error(failure.kind()));
            }
        }
        result
    }

    /// Moves the run onto a background thread.
    pub fn spawn(mut self) -> PipelineHandle {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let thread = thread::spawn(move || self.run());
        PipelineHandle {
            state,
            cancel,
            thread,
        }
    }

    fn run_stages(&mut self) -> Result<PipelineReport, PipelineFailure> {
        self.enter(Stage::Importing);
        let (_scratch, ctx) = self.prepare_context().at(Stage::Importing)?;
        let mut scene = Scene::new();
        let target = self
            .import_armature(&mut scene, &self.inputs.target_avatar, "target avatar", &ctx, false)
            .at(Stage::Importing)?;
        let source = self
            .import_armature(&mut scene, &self.inputs.source_pose, "source pose", &ctx, true)
            .at(Stage::Importing)?;

        self.enter(Stage::Retargeting);
        let (transfer, unmatched_bones, mut warnings) =
            retarget(&mut scene, source, target).at(Stage::Retargeting)?;

        self.enter(Stage::Baking);
        scene.frame_current = BAKE_FRAME;
        let bake = bake_visual_pose(&mut scene, target).at(Stage::Baking)?;
        warnings.extend(
            bake.deferred_constraints
                .iter()
                .map(|name| format!("constraint `{name}` left for the engine to bake")),
        );
        remove_source_rig(&mut scene, source);

        self.enter(Stage::Exporting);
        sanitize_metadata(&mut scene, target, &self.config.reserved_namespace);
        let export_path = self.inputs.export_path();
        let request = ExportRequest::build(
            &scene,
            target,
            &self.inputs.target_avatar,
            export_path,
            self.config.export.clone(),
        )
        .at(Stage::Exporting)?;
        let export_path =
            export_artifact(self.engine.as_ref(), &request, &ctx).at(Stage::Exporting)?;
        tracing::info!(path = %export_path.display(), "export artifact written");

        let preview = if self.render_preview {
            self.enter(Stage::RenderingPreview);
            let request = PreviewRequest::new(
                export_path.clone(),
                self.inputs.preview_path(),
                self.config.preview.clone(),
            );
            match render_preview(self.engine.as_ref(), &request, &ctx) {
                Ok(path) => PreviewOutcome::Rendered(path),
                Err(err) => {
                    tracing::warn!(%err, "preview render failed, keeping export");
                    warnings.push(format!("preview not rendered: {err}"));
                    PreviewOutcome::Failed(err)
                }
            }
        } else {
            PreviewOutcome::Skipped
        };

        Ok(PipelineReport {
            export_path,
            preview,
            transfer,
            bake,
            unmatched_bones,
            warnings,
        })
    }

    fn prepare_context(&self) -> crate::Result<(Option<TempDir>, RunContext)> {
        let (scratch, work_dir) = match &self.config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (None, dir.clone())
            }
            None => {
                let dir = tempfile::Builder::new().prefix("pose-transfer-").tempdir()?;
                let path = dir.path().to_path_buf();
                (Some(dir), path)
            }
        };
        tracing::debug!(work_dir = %work_dir.display(), "prepared working directory");
        let ctx = RunContext::new(work_dir)
            .with_timeout(self.config.timeout())
            .with_cancel(self.cancel.clone());
        Ok((scratch, ctx))
    }

    /// Imports `path` and picks its armature: the first one for the target,
    /// the last one for the source.
    fn import_armature(
        &self,
        scene: &mut Scene,
        path: &Path,
        role: &str,
        ctx: &RunContext,
        take_last: bool,
    ) -> crate::Result<ObjectId> {
        tracing::info!(role, path = %path.display(), "importing");
        let imported = self.engine.import_scene(path, ctx)?;
        let ids = scene.merge(imported);
        let armatures = scene.armatures(&ids);
        let chosen = if take_last {
            armatures.last()
        } else {
            armatures.first()
        };
        chosen
            .copied()
            .ok_or_else(|| PoseTransferError::missing_rig(format!("{role} `{}`", path.display())))
    }

    fn enter(&self, stage: Stage) {
        tracing::info!(%stage, "entering stage");
        self.set_state(stage.into());
    }

    fn set_state(&self, state: PipelineState) {
        match self.state.lock() {
            Ok(mut slot) => {
                tracing::debug!(from = ?*slot, to = ?state, "pipeline state change");
                *slot = state;
            }
            Err(_) => tracing::warn!("pipeline state has been poisoned"),
        }
    }
}

fn retarget(
    scene: &mut Scene,
    source: ObjectId,
    target: ObjectId,
) -> crate::Result<(TransferSummary, Vec<String>, Vec<String>)> {
    let source_skeleton = &scene
        .armature(source)
        .ok_or_else(|| PoseTransferError::missing_rig("source pose"))?
        .skeleton;
    let target_skeleton = &scene
        .armature(target)
        .ok_or_else(|| PoseTransferError::missing_rig("target avatar"))?
        .skeleton;

    let map = CorrespondenceMap::resolve(source_skeleton, target_skeleton)?;
    let pose = Pose::capture(source_skeleton);
    let unmatched: Vec<String> = map
        .unmatched()
        .iter()
        .filter_map(|id| target_skeleton.bone(*id))
        .map(|bone| bone.name.clone())
        .collect();
    if !unmatched.is_empty() {
        tracing::info!(count = unmatched.len(), "target bones without a source match stay at rest");
    }
    let warnings = map.warnings().to_vec();

    let armature = scene
        .armature_mut(target)
        .ok_or_else(|| PoseTransferError::missing_rig("target avatar"))?;
    let summary = transfer_pose(&mut armature.skeleton, &map, &pose);
    Ok((summary, unmatched, warnings))
}

fn read_state(state: &Mutex<PipelineState>) -> PipelineState {
    state
        .lock()
        .map(|guard| *guard)
        .unwrap_or(PipelineState::Error(ErrorKind::Other))
}

/// Handle to a pipeline running on a background thread.
pub struct PipelineHandle {
    state: Arc<Mutex<PipelineState>>,
    cancel: CancellationToken,
    thread: JoinHandle<Result<PipelineReport, PipelineFailure>>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        read_state(&self.state)
    }

    /// Asks the run to stop; an engine call in flight is killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<PipelineReport, PipelineFailure> {
        let stage = read_state(&self.state).stage().unwrap_or(Stage::Importing);
        self.thread.join().unwrap_or_else(|_| {
            Err(PipelineFailure {
                stage,
                error: PoseTransferError::msg("pipeline thread panicked"),
            })
        })
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use glam::{Quat, Vec3};
    use serde_json::json;

    use super::*;
    use crate::scene::{
        AnimationData, Armature, ImportedObject, ImportedScene, NlaStrip, ObjectKind,
    };
    use crate::skeleton::{Bone, BoneId, Skeleton, Transform};

    /// In-memory engine: imports come from a table, exports and previews
    /// write placeholder files and are recorded.
    #[derive(Default)]
    struct FakeEngine {
        scenes: HashMap<PathBuf, ImportedScene>,
        fail_preview: bool,
        calls: Mutex<Vec<String>>,
        exports: Mutex<Vec<ExportRequest>>,
    }

    impl FakeEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn last_export(&self) -> ExportRequest {
            self.exports.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl Engine for FakeEngine {
        fn import_scene(&self, path: &Path, _ctx: &RunContext) -> crate::Result<ImportedScene> {
            self.calls.lock().unwrap().push(format!("import {}", path.display()));
            self.scenes
                .get(path)
                .cloned()
                .ok_or_else(|| PoseTransferError::msg(format!("no such file {}", path.display())))
        }

        fn export_scene(&self, request: &ExportRequest, _ctx: &RunContext) -> crate::Result<()> {
            self.calls.lock().unwrap().push("export".to_string());
            self.exports.lock().unwrap().push(request.clone());
            std::fs::write(&request.output, b"fbx").map_err(|err| PoseTransferError::ExportFailed {
                diagnostic: err.to_string(),
            })
        }

        fn render_preview(&self, request: &PreviewRequest, _ctx: &RunContext) -> crate::Result<()> {
            self.calls.lock().unwrap().push("preview".to_string());
            if self.fail_preview {
                return Err(PoseTransferError::PreviewRender {
                    diagnostic: "renderer crashed".to_string(),
                });
            }
            std::fs::write(&request.image, b"png")?;
            Ok(())
        }
    }

    fn rig_object(name: &str, bones: Vec<Bone>, strips: usize) -> ImportedObject {
        let nla_strips = (0..strips)
            .map(|i| NlaStrip {
                name: format!("Strip{i}"),
                action: "Take".to_string(),
                frame_start: 1,
                frame_end: 30,
            })
            .collect();
        ImportedObject {
            name: name.to_string(),
            parent: None,
            properties: BTreeMap::from([
                ("importer".to_string(), json!("fbx")),
                ("_RNA_UI".to_string(), json!({})),
            ]),
            kind: ObjectKind::Armature(Armature {
                skeleton: Skeleton::from_bones(bones).unwrap(),
                animation: AnimationData {
                    action: None,
                    nla_strips,
                },
            }),
        }
    }

    fn mesh_object(name: &str, parent: usize) -> ImportedObject {
        ImportedObject {
            name: name.to_string(),
            parent: Some(parent),
            properties: BTreeMap::from([("fbx_source".to_string(), json!("mixamo"))]),
            kind: ObjectKind::Mesh,
        }
    }

    fn rotations() -> [Quat; 3] {
        [
            Quat::from_rotation_y(0.5),
            Quat::from_rotation_x(0.25),
            Quat::from_rotation_z(-0.75),
        ]
    }

    fn source_scene() -> ImportedScene {
        let [q1, q2, q3] = rotations();
        let mut hips = Bone::new("Hips", None, Transform::IDENTITY);
        hips.pose = Transform::from_translation_rotation(Vec3::new(0.0, 1.0, 0.0), q1);
        let mut spine = Bone::new("Spine", Some(BoneId(0)), Transform::IDENTITY);
        spine.pose.rotation = q2;
        let mut head = Bone::new("Head", Some(BoneId(1)), Transform::IDENTITY);
        head.pose.rotation = q3;
        ImportedScene {
            source: PathBuf::from("pose.fbx"),
            objects: vec![rig_object("PoseRig", vec![hips, spine, head], 0)],
        }
    }

    fn target_scene(names: &[&str]) -> ImportedScene {
        let bones = names
            .iter()
            .enumerate()
            .map(|(i, name)| Bone::new(*name, i.checked_sub(1).map(BoneId), Transform::IDENTITY))
            .collect();
        ImportedScene {
            source: PathBuf::from("avatar.fbx"),
            objects: vec![rig_object("Avatar", bones, 2), mesh_object("Body", 0)],
        }
    }

    fn setup(target: ImportedScene) -> (FakeEngine, PipelineInputs, TempDir) {
        let out = tempfile::tempdir().unwrap();
        let inputs = PipelineInputs {
            source_pose: PathBuf::from("pose.fbx"),
            target_avatar: PathBuf::from("avatar.fbx"),
            output_dir: out.path().to_path_buf(),
            output_name: "posed".to_string(),
        };
        let mut engine = FakeEngine::default();
        engine.scenes.insert(inputs.source_pose.clone(), source_scene());
        engine.scenes.insert(inputs.target_avatar.clone(), target);
        (engine, inputs, out)
    }

    fn key(request: &ExportRequest, bone: &str) -> Transform {
        request.action.channel(bone).unwrap().keys[0].transform
    }

    fn same_rotation(a: Quat, b: Quat) -> bool {
        a.abs_diff_eq(b, 1e-5) || a.abs_diff_eq(-b, 1e-5)
    }

    #[test]
    fn transfers_bakes_and_exports_a_single_pose() {
        let (engine, inputs, _out) = setup(target_scene(&["Hips", "Spine", "Head", "LeftArm"]));
        let engine = Arc::new(engine);
        let mut pipeline = Pipeline::new(engine.clone(), inputs.clone(), PipelineConfig::default());

        let report = pipeline.run().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(report.export_path, inputs.export_path());
        assert!(inputs.export_path().is_file());
        assert!(matches!(report.preview, PreviewOutcome::Rendered(ref p) if p.is_file()));
        assert_eq!(report.transfer, TransferSummary { rotated: 3, translated: 1 });
        assert_eq!(report.unmatched_bones, vec!["LeftArm".to_string()]);

        let request = engine.last_export();
        let [q1, q2, q3] = rotations();
        assert!(same_rotation(key(&request, "Hips").rotation, q1));
        assert!(key(&request, "Hips").translation.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-5));
        assert!(same_rotation(key(&request, "Spine").rotation, q2));
        assert!(same_rotation(key(&request, "Head").rotation, q3));
        assert!(same_rotation(key(&request, "LeftArm").rotation, Quat::IDENTITY));
        assert!(key(&request, "LeftArm").translation.abs_diff_eq(Vec3::ZERO, 1e-5));
    }

    #[test]
    fn export_has_one_frame_no_strips_and_clean_metadata() {
        let (engine, inputs, _out) = setup(target_scene(&["Hips", "Spine"]));
        let engine = Arc::new(engine);

        Pipeline::new(engine.clone(), inputs, PipelineConfig::default())
            .run()
            .unwrap();

        let request = engine.last_export();
        assert_eq!(request.action.frame_count(), 1);
        assert!(request.nla_strips.is_empty());
        assert!(!request.settings.bake_anim_use_nla_strips);
        let keys: Vec<_> = request.armature.properties.keys().cloned().collect();
        assert_eq!(keys, vec!["_RNA_UI".to_string()]);
        assert!(request.meshes.iter().all(|mesh| mesh.properties.is_empty()));
    }

    #[test]
    fn pose_file_without_armature_fails_before_baking() {
        let (mut engine, inputs, _out) = setup(target_scene(&["Hips"]));
        engine.scenes.insert(
            inputs.source_pose.clone(),
            ImportedScene {
                source: inputs.source_pose.clone(),
                objects: vec![mesh_object("Loose", 0)],
            },
        );
        let engine = Arc::new(engine);
        let mut pipeline = Pipeline::new(engine.clone(), inputs.clone(), PipelineConfig::default());

        let failure = pipeline.run().unwrap_err();

        assert_eq!(failure.stage, Stage::Importing);
        assert_eq!(failure.kind(), ErrorKind::MissingRig);
        assert_eq!(pipeline.state(), PipelineState::Error(ErrorKind::MissingRig));
        assert!(!engine.calls().iter().any(|call| call == "export"));
        assert!(!inputs.export_path().exists());
    }

    #[test]
    fn avatar_without_armature_fails_before_the_pose_is_read() {
        let (mut engine, inputs, _out) = setup(target_scene(&["Hips"]));
        engine.scenes.insert(
            inputs.target_avatar.clone(),
            ImportedScene {
                source: inputs.target_avatar.clone(),
                objects: vec![mesh_object("Statue", 0)],
            },
        );
        let engine = Arc::new(engine);
        let mut pipeline = Pipeline::new(engine.clone(), inputs.clone(), PipelineConfig::default());

        let failure = pipeline.run().unwrap_err();

        assert_eq!(failure.stage, Stage::Importing);
        assert_eq!(failure.kind(), ErrorKind::MissingRig);
        assert!(failure.to_string().contains("target avatar"));
        assert_eq!(engine.calls(), vec!["import avatar.fbx".to_string()]);
        assert!(!inputs.export_path().exists());
    }

    #[test]
    fn unmatched_target_still_exports() {
        let (engine, inputs, _out) = setup(target_scene(&["RightHips", "Tail"]));
        let engine = Arc::new(engine);

        let report = Pipeline::new(engine.clone(), inputs, PipelineConfig::default())
            .run()
            .unwrap();

        assert_eq!(report.transfer, TransferSummary::default());
        let request = engine.last_export();
        assert!(key(&request, "RightHips").translation.abs_diff_eq(Vec3::ZERO, 1e-6));
        assert!(same_rotation(key(&request, "RightHips").rotation, Quat::IDENTITY));
    }

    #[test]
    fn unwritable_output_directory_fails_export_without_preview() {
        let (engine, mut inputs, out) = setup(target_scene(&["Hips"]));
        let blocker = out.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();
        inputs.output_dir = blocker.join("exports");
        let engine = Arc::new(engine);
        let mut pipeline = Pipeline::new(engine.clone(), inputs.clone(), PipelineConfig::default());

        let failure = pipeline.run().unwrap_err();

        assert_eq!(failure.stage, Stage::Exporting);
        assert_eq!(failure.kind(), ErrorKind::ExportFailed);
        assert!(failure.to_string().starts_with("exporting failed"));
        assert!(!engine.calls().iter().any(|call| call == "preview"));
        assert!(!inputs.preview_path().exists());
    }

    #[test]
    fn preview_failure_keeps_the_export() {
        let (mut engine, inputs, _out) = setup(target_scene(&["Hips"]));
        engine.fail_preview = true;

        let report = Pipeline::new(Arc::new(engine), inputs.clone(), PipelineConfig::default())
            .run()
            .unwrap();

        assert!(inputs.export_path().is_file());
        assert!(matches!(
            report.preview,
            PreviewOutcome::Failed(PoseTransferError::PreviewRender { .. })
        ));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn runs_on_a_background_thread() {
        let (engine, inputs, _out) = setup(target_scene(&["Hips", "Spine"]));
        let handle = Pipeline::new(Arc::new(engine), inputs.clone(), PipelineConfig::default())
            .without_preview()
            .spawn();

        let report = handle.join().unwrap();

        assert!(matches!(report.preview, PreviewOutcome::Skipped));
        assert!(!inputs.preview_path().exists());
    }
}
