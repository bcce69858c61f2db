use crate::scene::{ObjectId, Scene};

/// Property namespace the host engine keeps for its own serialization.
pub const RESERVED_NAMESPACE: &str = "_RNA_UI";

pub fn is_reserved(key: &str, reserved_prefix: &str) -> bool {
    !reserved_prefix.is_empty() && key.starts_with(reserved_prefix)
}

/// Strips custom properties from the armature and its direct mesh children,
/// keeping only keys under `reserved_prefix`. Returns how many keys were
/// removed.
pub fn sanitize_metadata(scene: &mut Scene, armature_id: ObjectId, reserved_prefix: &str) -> usize {
    let mut targets = vec![armature_id];
    targets.extend(scene.mesh_children(armature_id));

    let mut removed = 0;
    for id in targets {
        let Some(object) = scene.get_mut(id) else {
            continue;
        };
        let before = object.properties.len();
        object
            .properties
            .retain(|key, _| is_reserved(key, reserved_prefix));
        let stripped = before - object.properties.len();
        if stripped > 0 {
            tracing::debug!(object = %object.name, stripped, "removed custom properties");
        }
        removed += stripped;
    }

    tracing::info!(removed, "sanitized export metadata");
    removed
}
