use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bake::Action;
use crate::engine::{Engine, RunContext};
use crate::scene::{NlaStrip, ObjectId, Scene};
use crate::{PoseTransferError, Result};

pub const EXPORT_EXTENSION: &str = "fbx";

/// Options handed to the interchange exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub use_selection: bool,
    pub apply_unit_scale: bool,
    pub bake_anim: bool,
    pub bake_anim_use_all_bones: bool,
    pub bake_anim_use_nla_strips: bool,
    pub add_leaf_bones: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            use_selection: true,
            apply_unit_scale: true,
            bake_anim: true,
            bake_anim_use_all_bones: true,
            bake_anim_use_nla_strips: false,
            add_leaf_bones: false,
        }
    }
}

/// Object selected for export together with the properties it keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportObject {
    pub name: String,
    pub properties: BTreeMap<String, Value>,
}

/// Constraint still on the rig after baking. The engine evaluates it in its
/// own visual-keying bake and then removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredConstraint {
    pub bone: String,
    pub name: String,
}

/// Everything the engine needs to write the export artifact: the file the
/// target was imported from, the selection, the baked action and the
/// exporter options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub source_file: PathBuf,
    pub output: PathBuf,
    pub armature: ExportObject,
    pub meshes: Vec<ExportObject>,
    pub action: Action,
    pub nla_strips: Vec<NlaStrip>,
    #[serde(default)]
    pub deferred_constraints: Vec<DeferredConstraint>,
    pub settings: ExportSettings,
}

pub fn export_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{name}.{EXPORT_EXTENSION}"))
}

impl ExportRequest {
    /// Selects the armature and its mesh children. Unrelated scene objects
    /// are left out and NLA strips are flattened away.
    pub fn build(
        scene: &Scene,
        armature_id: ObjectId,
        source_file: &Path,
        output: PathBuf,
        settings: ExportSettings,
    ) -> Result<Self> {
        let object = scene
            .get(armature_id)
            .filter(|object| object.is_armature())
            .ok_or_else(|| PoseTransferError::missing_rig("scene selected for export"))?;
        let armature = scene
            .armature(armature_id)
            .ok_or_else(|| PoseTransferError::missing_rig("scene selected for export"))?;
        let action = armature
            .animation
            .action
            .clone()
            .ok_or_else(|| PoseTransferError::ExportFailed {
                diagnostic: format!("armature `{}` has no baked action", object.name),
            })?;

        let dropped = armature.animation.nla_strips.len();
        if dropped > 0 {
            tracing::debug!(dropped, "flattening nla strips into the baked action");
        }

        let deferred_constraints = armature
            .skeleton
            .bones()
            .iter()
            .flat_map(|bone| {
                bone.constraints.iter().map(|constraint| DeferredConstraint {
                    bone: bone.name.clone(),
                    name: constraint.name().to_string(),
                })
            })
            .collect();

        let meshes = scene
            .mesh_children(armature_id)
            .into_iter()
            .filter_map(|id| scene.get(id))
            .map(|mesh| ExportObject {
                name: mesh.name.clone(),
                properties: mesh.properties.clone(),
            })
            .collect();

        Ok(Self {
            source_file: source_file.to_path_buf(),
            output,
            armature: ExportObject {
                name: object.name.clone(),
                properties: object.properties.clone(),
            },
            meshes,
            action,
            nla_strips: Vec::new(),
            deferred_constraints,
            settings,
        })
    }

    /// Checks the invariants of a single-pose export.
    pub fn validate(&self) -> Result<()> {
        let fail = |diagnostic: String| Err(PoseTransferError::ExportFailed { diagnostic });
        let settings = &self.settings;

        if !settings.use_selection {
            return fail("export must be limited to the selected rig".into());
        }
        if !settings.apply_unit_scale {
            return fail("export must apply unit scale".into());
        }
        if !settings.bake_anim || !settings.bake_anim_use_all_bones {
            return fail("export must bake animation for every bone".into());
        }
        if settings.bake_anim_use_nla_strips || !self.nla_strips.is_empty() {
            return fail("nla strips must be flattened before export".into());
        }
        if settings.add_leaf_bones {
            return fail("leaf bones must not be added".into());
        }
        let frames = self.action.frame_count();
        if frames != 1 || self.action.frame_start != self.action.frame_end {
            return fail(format!(
                "baked action `{}` spans {frames} frames, expected exactly one",
                self.action.name
            ));
        }
        Ok(())
    }
}

/// Writes the export artifact through `engine` and returns its path.
pub fn export_artifact(
    engine: &dyn Engine,
    request: &ExportRequest,
    ctx: &RunContext,
) -> Result<PathBuf> {
    request.validate()?;

    if let Some(dir) = request.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|err| PoseTransferError::ExportFailed {
            diagnostic: format!("cannot create output directory `{}`: {err}", dir.display()),
        })?;
    }

    tracing::info!(
        output = %request.output.display(),
        meshes = request.meshes.len(),
        deferred_constraints = request.deferred_constraints.len(),
        "exporting rig"
    );
    engine.export_scene(request, ctx)?;

    if !request.output.is_file() {
        return Err(PoseTransferError::ExportFailed {
            diagnostic: format!(
                "engine reported success but `{}` was not written",
                request.output.display()
            ),
        });
    }
    Ok(request.output.clone())
}
