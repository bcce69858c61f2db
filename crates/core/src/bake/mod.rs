use std::collections::BTreeSet;

use glam::{EulerRot, Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::scene::{ObjectId, Scene};
use crate::skeleton::{Constraint, ConstraintSpace, Skeleton, Transform};
use crate::{PoseTransferError, Result};

/// Frame the retargeted pose is committed on.
pub const BAKE_FRAME: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformKey {
    pub frame: i32,
    pub transform: Transform,
}

/// Keys of a single bone. Rotation is always stored as a quaternion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoneChannel {
    pub bone: String,
    pub keys: Vec<TransformKey>,
}

/// Keyframed action owned by an armature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub channels: Vec<BoneChannel>,
}

impl Action {
    /// Number of distinct frames carrying at least one key.
    pub fn frame_count(&self) -> usize {
        self.channels
            .iter()
            .flat_map(|channel| channel.keys.iter().map(|key| key.frame))
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn channel(&self, bone: &str) -> Option<&BoneChannel> {
        self.channels.iter().find(|channel| channel.bone == bone)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BakeSummary {
    pub action: String,
    pub frame: i32,
    pub keyed_bones: usize,
    pub constraints_cleared: usize,
    /// `bone/constraint` pairs left on the rig for the engine's visual bake.
    pub deferred_constraints: Vec<String>,
}

/// World matrices of the skeleton as they are displayed, i.e. with every
/// bone constraint applied on top of the local channels. Unsupported
/// constraints contribute nothing.
pub fn visual_world_matrices(skeleton: &Skeleton) -> Result<Vec<Mat4>> {
    let raw = skeleton.world_matrices()?;
    let order = skeleton.evaluation_order()?;
    let names = skeleton.name_index();

    let mut visual = raw.clone();
    let mut evaluated = vec![false; skeleton.len()];

    for id in order {
        let Some(bone) = skeleton.bone(id) else {
            continue;
        };
        let basis = match bone.parent {
            Some(parent) => visual[parent.0] * bone.rest.to_matrix(),
            None => bone.rest.to_matrix(),
        };
        let mut world = basis * bone.pose.to_matrix();

        for constraint in &bone.constraints {
            world = apply_constraint(world, basis, constraint, |name| {
                names.get(name).map(|other| {
                    if evaluated[other.0] {
                        visual[other.0]
                    } else {
                        raw[other.0]
                    }
                })
            });
        }

        visual[id.0] = world;
        evaluated[id.0] = true;
    }

    Ok(visual)
}

/// `basis` is the bone's rest frame under its posed parent, the frame
/// local-space constraints are measured in.
fn apply_constraint(
    world: Mat4,
    basis: Mat4,
    constraint: &Constraint,
    lookup: impl Fn(&str) -> Option<Mat4>,
) -> Mat4 {
    let (scale, rotation, translation) = world.to_scale_rotation_translation();
    match constraint {
        Constraint::CopyRotation {
            subtarget,
            influence,
            ..
        } => match lookup(subtarget) {
            Some(other) => {
                let (_, target_rotation, _) = other.to_scale_rotation_translation();
                let blended = rotation.slerp(target_rotation, influence.clamp(0.0, 1.0));
                Mat4::from_scale_rotation_translation(scale, blended.normalize(), translation)
            }
            None => world,
        },
        Constraint::CopyLocation {
            subtarget,
            influence,
            ..
        } => match lookup(subtarget) {
            Some(other) => {
                let target_translation = other.w_axis.truncate();
                let blended = translation.lerp(target_translation, influence.clamp(0.0, 1.0));
                Mat4::from_scale_rotation_translation(scale, rotation, blended)
            }
            None => world,
        },
        Constraint::LimitRotation {
            min,
            max,
            use_limit,
            space,
            influence,
            ..
        } => {
            let frame = match space {
                ConstraintSpace::World => Mat4::IDENTITY,
                ConstraintSpace::Local => basis,
            };
            let (scale, rotation, translation) =
                (frame.inverse() * world).to_scale_rotation_translation();
            let limited = limit_euler(rotation, *min, *max, *use_limit);
            let blended = rotation.slerp(limited, influence.clamp(0.0, 1.0)).normalize();
            frame * Mat4::from_scale_rotation_translation(scale, blended, translation)
        }
        Constraint::Unsupported { .. } => world,
    }
}

/// Clamps the XYZ euler angles of `rotation` (X applied first) per axis.
fn limit_euler(rotation: Quat, min: Vec3, max: Vec3, use_limit: [bool; 3]) -> Quat {
    let (z, y, x) = rotation.to_euler(EulerRot::ZYX);
    let mut angles = Vec3::new(x, y, z);
    for axis in 0..3 {
        if use_limit[axis] {
            angles[axis] = angles[axis].max(min[axis]).min(max[axis]);
        }
    }
    Quat::from_euler(EulerRot::ZYX, angles.z, angles.y, angles.x)
}

/// Commits the armature's visual pose at the scene's current frame as a
/// one-frame action.
///
/// Baked channels are rest-relative values recovered from the visual world
/// transforms and the evaluated constraints are removed. When any bone
/// carries a constraint the evaluator does not understand, the raw channels
/// are keyed instead and every constraint stays on the rig so the engine's
/// visual-keying bake evaluates the whole stack. The armature's current
/// action is replaced.
pub fn bake_visual_pose(scene: &mut Scene, armature_id: ObjectId) -> Result<BakeSummary> {
    let frame = scene.frame_current;
    let object_name = scene
        .get(armature_id)
        .map(|object| object.name.clone())
        .ok_or_else(|| PoseTransferError::missing_rig("scene (armature to bake was removed)"))?;
    let armature = scene
        .armature_mut(armature_id)
        .ok_or_else(|| PoseTransferError::missing_rig(format!("object `{object_name}`")))?;

    let deferred_constraints: Vec<String> = armature
        .skeleton
        .bones()
        .iter()
        .flat_map(|bone| {
            bone.constraints
                .iter()
                .filter(|constraint| !constraint.is_supported())
                .map(move |constraint| format!("{}/{}", bone.name, constraint.name()))
        })
        .collect();
    let evaluate = deferred_constraints.is_empty();
    if !evaluate {
        tracing::warn!(
            armature = %object_name,
            constraints = ?deferred_constraints,
            "constraints left for the engine's visual bake"
        );
    }

    let visual = if evaluate {
        visual_world_matrices(&armature.skeleton)?
    } else {
        armature.skeleton.world_matrices()?
    };
    let mut channels = Vec::with_capacity(armature.skeleton.len());
    let mut constraints_cleared = 0;

    let parents: Vec<_> = armature.skeleton.bones().iter().map(|b| b.parent).collect();
    for (id, bone) in armature.skeleton.iter_mut() {
        // Channels relative to rest: (parent_visual * rest)^-1 * visual.
        let bind = match parents[id.0] {
            Some(parent) => visual[parent.0] * bone.rest.to_matrix(),
            None => bone.rest.to_matrix(),
        };
        let transform = Transform::from_matrix(&(bind.inverse() * visual[id.0]));

        bone.pose = transform;
        if evaluate {
            constraints_cleared += bone.constraints.len();
            bone.constraints.clear();
        }

        channels.push(BoneChannel {
            bone: bone.name.clone(),
            keys: vec![TransformKey { frame, transform }],
        });
    }

    let action_name = armature
        .animation
        .action
        .as_ref()
        .map(|action| action.name.clone())
        .unwrap_or_else(|| format!("{object_name}Action"));
    let keyed_bones = channels.len();
    armature.animation.action = Some(Action {
        name: action_name.clone(),
        frame_start: frame,
        frame_end: frame,
        channels,
    });

    tracing::info!(
        armature = %object_name,
        frame,
        keyed_bones,
        constraints_cleared,
        "baked visual pose"
    );

    Ok(BakeSummary {
        action: action_name,
        frame,
        keyed_bones,
        constraints_cleared,
        deferred_constraints,
    })
}

/// Deletes the source rig (and anything parented to it) from the scene.
/// Returns the number of removed objects; a missing rig is not an error.
pub fn remove_source_rig(scene: &mut Scene, source_id: ObjectId) -> usize {
    let removed = scene.remove(source_id);
    if removed.is_empty() {
        tracing::warn!(?source_id, "source rig already absent, nothing to delete");
    } else {
        tracing::info!(count = removed.len(), "removed source rig");
    }
    removed.len()
}
