use std::collections::BTreeMap;

use crate::skeleton::{BoneId, Skeleton};
use crate::{PoseTransferError, Result};

/// Routes each target bone to the source bone sharing its exact name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrespondenceMap {
    routes: BTreeMap<BoneId, BoneId>,
    unmatched: Vec<BoneId>,
    warnings: Vec<String>,
}

impl CorrespondenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches target bones to source bones by case-sensitive name equality.
    ///
    /// Fails with `MissingRig` when either side has no bones; a target bone
    /// without a partner is simply recorded in [`CorrespondenceMap::unmatched`].
    /// Duplicate names resolve to the last declared bone and are reported as
    /// warnings.
    pub fn resolve(source: &Skeleton, target: &Skeleton) -> Result<Self> {
        if source.is_empty() {
            return Err(PoseTransferError::missing_rig("source skeleton (no bones)"));
        }
        if target.is_empty() {
            return Err(PoseTransferError::missing_rig("target skeleton (no bones)"));
        }

        let mut map = Self::new();
        for (side, skeleton) in [("source", source), ("target", target)] {
            for name in skeleton.duplicate_names() {
                tracing::warn!(side, bone = %name, "duplicate bone name, last declaration wins");
                map.warnings
                    .push(format!("{side} skeleton declares bone `{name}` more than once"));
            }
        }

        let source_index = source.name_index();
        let target_index = target.name_index();
        for (target_id, bone) in target.iter() {
            // Only the winning declaration of a duplicated name takes part.
            if target_index.get(bone.name.as_str()) != Some(&target_id) {
                continue;
            }
            match source_index.get(bone.name.as_str()) {
                Some(source_id) => {
                    map.routes.insert(target_id, *source_id);
                }
                None => map.unmatched.push(target_id),
            }
        }

        tracing::debug!(
            matched = map.routes.len(),
            unmatched = map.unmatched.len(),
            "resolved bone correspondence"
        );
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Source bone routed to `target`, if any.
    pub fn source_for(&self, target: BoneId) -> Option<BoneId> {
        self.routes.get(&target).copied()
    }

    /// `(target, source)` pairs ordered by target id.
    pub fn routes(&self) -> impl Iterator<Item = (BoneId, BoneId)> + '_ {
        self.routes.iter().map(|(t, s)| (*t, *s))
    }

    /// Target bones that keep their rest pose.
    pub fn unmatched(&self) -> &[BoneId] {
        &self.unmatched
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{Bone, Transform};

    fn skeleton(names: &[&str]) -> Skeleton {
        let bones = names
            .iter()
            .map(|name| Bone::new(*name, None, Transform::IDENTITY))
            .collect();
        Skeleton::from_bones(bones).unwrap()
    }

    #[test]
    fn matches_exact_names_only() {
        let source = skeleton(&["Hips", "Spine", "Head"]);
        let target = skeleton(&["Hips", "spine", "RightHips", "Head"]);

        let map = CorrespondenceMap::resolve(&source, &target).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.source_for(BoneId(0)), Some(BoneId(0)));
        assert_eq!(map.source_for(BoneId(3)), Some(BoneId(2)));
        assert_eq!(map.unmatched(), &[BoneId(1), BoneId(2)]);
    }

    #[test]
    fn empty_skeletons_are_missing_rigs() {
        let full = skeleton(&["Hips"]);
        let empty = Skeleton::new();

        let err = CorrespondenceMap::resolve(&empty, &full).unwrap_err();
        assert!(matches!(err, PoseTransferError::MissingRig { .. }));
        let err = CorrespondenceMap::resolve(&full, &empty).unwrap_err();
        assert!(matches!(err, PoseTransferError::MissingRig { .. }));
    }

    #[test]
    fn duplicates_warn_and_use_last_declaration() {
        let source = skeleton(&["Hips", "Spine", "Hips"]);
        let target = skeleton(&["Hips"]);

        let map = CorrespondenceMap::resolve(&source, &target).unwrap();

        assert_eq!(map.source_for(BoneId(0)), Some(BoneId(2)));
        assert_eq!(map.warnings().len(), 1);
        assert!(map.warnings()[0].contains("Hips"));
    }

    #[test]
    fn disjoint_names_resolve_to_an_empty_map() {
        let map =
            CorrespondenceMap::resolve(&skeleton(&["A"]), &skeleton(&["B", "C"])).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.unmatched().len(), 2);
    }
}
