use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::{PoseTransferError, Result};

/// Stable index of a bone inside its [`Skeleton`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BoneId(pub usize);

/// Translation, rotation and scale of a node relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_translation_rotation(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
            scale: Vec3::ONE,
        }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation: rotation.normalize(),
            scale,
        }
    }
}

/// Space a rotation limit is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSpace {
    World,
    /// Relative to the bone's rest orientation under its posed parent.
    Local,
}

/// Bone constraint as seen when the pose is baked with visual keying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// Blend the bone's world rotation towards another bone's world rotation.
    CopyRotation {
        name: String,
        subtarget: String,
        influence: f32,
    },
    /// Blend the bone's world position towards another bone's world position.
    CopyLocation {
        name: String,
        subtarget: String,
        influence: f32,
    },
    /// Clamp XYZ euler angles (radians) of the axes flagged in `use_limit`.
    LimitRotation {
        name: String,
        min: Vec3,
        max: Vec3,
        use_limit: [bool; 3],
        space: ConstraintSpace,
        influence: f32,
    },
    /// Any other constraint. Left on the bone for the engine to bake.
    Unsupported { name: String, kind: String },
}

impl Constraint {
    pub fn name(&self) -> &str {
        match self {
            Constraint::CopyRotation { name, .. }
            | Constraint::CopyLocation { name, .. }
            | Constraint::LimitRotation { name, .. }
            | Constraint::Unsupported { name, .. } => name,
        }
    }

    /// Whether the visual pose evaluator understands this constraint.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Constraint::Unsupported { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    pub parent: Option<BoneId>,
    /// Pose channels, applied on top of `rest`. Identity means rest pose.
    pub pose: Transform,
    /// Bind transform relative to the parent bone.
    pub rest: Transform,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Bone {
    pub fn new(name: impl Into<String>, parent: Option<BoneId>, rest: Transform) -> Self {
        Self {
            name: name.into(),
            parent,
            pose: Transform::IDENTITY,
            rest,
            constraints: Vec::new(),
        }
    }

    /// Parent-relative matrix of the posed bone.
    pub fn local_matrix(&self) -> Mat4 {
        self.rest.to_matrix() * self.pose.to_matrix()
    }
}

/// Arena of bones forming a forest. Parents are stored as indices into the
/// same arena, so a bone never owns its parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Skeleton {
    bones: Vec<Bone>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a skeleton and checks that every parent resolves inside the
    /// arena and that the hierarchy is acyclic.
    pub fn from_bones(bones: Vec<Bone>) -> Result<Self> {
        let skeleton = Self { bones };
        skeleton.validate()?;
        Ok(skeleton)
    }

    pub fn validate(&self) -> Result<()> {
        for (index, bone) in self.bones.iter().enumerate() {
            if let Some(BoneId(parent)) = bone.parent {
                if parent >= self.bones.len() {
                    return Err(PoseTransferError::InvalidSkeleton(format!(
                        "bone `{}` references missing parent #{parent}",
                        bone.name
                    )));
                }
                if parent == index {
                    return Err(PoseTransferError::InvalidSkeleton(format!(
                        "bone `{}` is its own parent",
                        bone.name
                    )));
                }
            }
        }
        self.evaluation_order().map(|_| ())
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn bone(&self, id: BoneId) -> Option<&Bone> {
        self.bones.get(id.0)
    }

    pub fn bone_mut(&mut self, id: BoneId) -> Option<&mut Bone> {
        self.bones.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BoneId, &Bone)> {
        self.bones.iter().enumerate().map(|(i, b)| (BoneId(i), b))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BoneId, &mut Bone)> {
        self.bones
            .iter_mut()
            .enumerate()
            .map(|(i, b)| (BoneId(i), b))
    }

    /// Looks a bone up by exact name. When the name is declared more than once
    /// the last declaration wins.
    pub fn find(&self, name: &str) -> Option<BoneId> {
        self.bones
            .iter()
            .rposition(|bone| bone.name == name)
            .map(BoneId)
    }

    /// Name to id index, last declaration wins.
    pub fn name_index(&self) -> HashMap<&str, BoneId> {
        self.iter().map(|(id, bone)| (bone.name.as_str(), id)).collect()
    }

    /// Names declared more than once, in first-seen order.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for bone in &self.bones {
            *counts.entry(bone.name.as_str()).or_default() += 1;
        }
        let mut duplicates = Vec::new();
        for bone in &self.bones {
            if counts.get(bone.name.as_str()).copied().unwrap_or(0) > 1
                && !duplicates.contains(&bone.name)
            {
                duplicates.push(bone.name.clone());
            }
        }
        duplicates
    }

    /// Returns bone ids ordered so that every parent precedes its children.
    pub fn evaluation_order(&self) -> Result<Vec<BoneId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.bones.len()];
        let mut order = Vec::with_capacity(self.bones.len());

        for start in 0..self.bones.len() {
            if marks[start] == Mark::Done {
                continue;
            }
            // Walk up to the first resolved ancestor, then emit top-down.
            let mut chain = Vec::new();
            let mut cursor = Some(start);
            while let Some(index) = cursor {
                match marks[index] {
                    Mark::Done => break,
                    Mark::Visiting => {
                        return Err(PoseTransferError::InvalidSkeleton(format!(
                            "cycle through bone `{}`",
                            self.bones[index].name
                        )))
                    }
                    Mark::Unvisited => {
                        marks[index] = Mark::Visiting;
                        chain.push(index);
                        cursor = self.bones[index]
                            .parent
                            .map(|p| p.0)
                            .filter(|p| *p < self.bones.len());
                    }
                }
            }
            for index in chain.into_iter().rev() {
                marks[index] = Mark::Done;
                order.push(BoneId(index));
            }
        }

        Ok(order)
    }

    /// World matrices of the current pose, indexed by bone id, without
    /// evaluating constraints.
    pub fn world_matrices(&self) -> Result<Vec<Mat4>> {
        let mut world = vec![Mat4::IDENTITY; self.bones.len()];
        for id in self.evaluation_order()? {
            let bone = &self.bones[id.0];
            let local = bone.local_matrix();
            world[id.0] = match bone.parent {
                Some(parent) => world[parent.0] * local,
                None => local,
            };
        }
        Ok(world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bone(name: &str, parent: Option<usize>) -> Bone {
        Bone::new(name, parent.map(BoneId), Transform::IDENTITY)
    }

    #[test]
    fn rejects_missing_parent() {
        let err = Skeleton::from_bones(vec![bone("Hips", None), bone("Spine", Some(7))])
            .unwrap_err();
        assert!(err.to_string().contains("Spine"));
    }

    #[test]
    fn rejects_cycles() {
        let err =
            Skeleton::from_bones(vec![bone("A", Some(1)), bone("B", Some(0))]).unwrap_err();
        assert!(matches!(err, PoseTransferError::InvalidSkeleton(_)));
    }

    #[test]
    fn orders_parents_before_children() {
        // Children declared before their parents.
        let skeleton = Skeleton::from_bones(vec![
            bone("Head", Some(1)),
            bone("Spine", Some(2)),
            bone("Hips", None),
        ])
        .unwrap();

        let order = skeleton.evaluation_order().unwrap();
        let position = |name: &str| {
            let id = skeleton.find(name).unwrap();
            order.iter().position(|o| *o == id).unwrap()
        };
        assert!(position("Hips") < position("Spine"));
        assert!(position("Spine") < position("Head"));
    }

    #[test]
    fn last_declared_duplicate_wins() {
        let skeleton =
            Skeleton::from_bones(vec![bone("Hips", None), bone("Hips", None)]).unwrap();
        assert_eq!(skeleton.find("Hips"), Some(BoneId(1)));
        assert_eq!(skeleton.duplicate_names(), vec!["Hips".to_string()]);
    }

    #[test]
    fn world_matrices_compose_parent_chain() {
        let mut hips = bone("Hips", None);
        hips.pose.translation = Vec3::new(0.0, 1.0, 0.0);
        let mut spine = Bone::new(
            "Spine",
            Some(BoneId(0)),
            Transform::from_translation_rotation(Vec3::new(0.0, 0.25, 0.0), Quat::IDENTITY),
        );
        spine.pose.translation = Vec3::new(0.0, 0.25, 0.0);
        let skeleton = Skeleton::from_bones(vec![hips, spine]).unwrap();

        let world = skeleton.world_matrices().unwrap();
        let spine_world = Transform::from_matrix(&world[1]);
        assert!(spine_world.translation.abs_diff_eq(Vec3::new(0.0, 1.5, 0.0), 1e-6));
    }
}
