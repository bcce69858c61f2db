use std::collections::HashMap;

use glam::{Quat, Vec3};

use crate::correspondence::CorrespondenceMap;
use crate::skeleton::{BoneId, Skeleton};

/// Substring (compared lowercase) marking the bone whose translation travels
/// with the pose.
pub const ROOT_MOTION_MARKER: &str = "hips";

/// Returns true when the bone's translation channel is transferred.
pub fn carries_translation(bone_name: &str) -> bool {
    bone_name.to_lowercase().contains(ROOT_MOTION_MARKER)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonePose {
    pub rotation: Quat,
    pub translation: Option<Vec3>,
}

/// Snapshot of a source skeleton's current channels, keyed by bone id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pose {
    bones: HashMap<BoneId, BonePose>,
}

impl Pose {
    /// Captures every bone's rotation (normalized) and translation.
    pub fn capture(skeleton: &Skeleton) -> Self {
        let bones = skeleton
            .iter()
            .map(|(id, bone)| {
                (
                    id,
                    BonePose {
                        rotation: normalize_or_identity(bone.pose.rotation),
                        translation: Some(bone.pose.translation),
                    },
                )
            })
            .collect();
        Self { bones }
    }

    pub fn get(&self, id: BoneId) -> Option<&BonePose> {
        self.bones.get(&id)
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub rotated: usize,
    pub translated: usize,
}

/// Copies the captured pose onto `target` through `map`.
///
/// Every routed bone gets the source rotation as a normalized quaternion.
/// Translation is written only for bones whose name contains `hips`
/// (case-insensitive); scale is never touched. Values are assigned, never
/// accumulated, so repeating the call is a no-op.
pub fn transfer_pose(
    target: &mut Skeleton,
    map: &CorrespondenceMap,
    pose: &Pose,
) -> TransferSummary {
    let mut summary = TransferSummary::default();

    for (target_id, source_id) in map.routes() {
        let Some(source) = pose.get(source_id) else {
            tracing::debug!(?source_id, "source bone missing from captured pose");
            continue;
        };
        let Some(bone) = target.bone_mut(target_id) else {
            continue;
        };

        bone.pose.rotation = normalize_or_identity(source.rotation);
        summary.rotated += 1;

        if carries_translation(&bone.name) {
            if let Some(translation) = source.translation {
                bone.pose.translation = translation;
                summary.translated += 1;
            }
        }
    }

    tracing::info!(
        rotated = summary.rotated,
        translated = summary.translated,
        "transferred pose"
    );
    summary
}

fn normalize_or_identity(rotation: Quat) -> Quat {
    if rotation.length_squared() <= f32::EPSILON || !rotation.is_finite() {
        Quat::IDENTITY
    } else {
        rotation.normalize()
    }
}
