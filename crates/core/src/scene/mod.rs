use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bake::Action;
use crate::skeleton::Skeleton;

/// Frame the scene starts on after a fresh import.
pub const DEFAULT_FRAME: i32 = 1;

/// Stable handle of an object inside a [`Scene`]. Ids are never reused, so a
/// handle stays valid (or resolves to nothing) after other objects are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// Nonlinear-animation strip attached to an armature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NlaStrip {
    pub name: String,
    pub action: String,
    pub frame_start: i32,
    pub frame_end: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimationData {
    pub action: Option<Action>,
    #[serde(default)]
    pub nla_strips: Vec<NlaStrip>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Armature {
    pub skeleton: Skeleton,
    #[serde(default)]
    pub animation: AnimationData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectKind {
    Armature(Armature),
    Mesh,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub name: String,
    pub parent: Option<ObjectId>,
    /// Custom key/value attributes attached by the authoring tool.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub kind: ObjectKind,
}

impl SceneObject {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            parent: None,
            properties: BTreeMap::new(),
            kind,
        }
    }

    pub fn armature(&self) -> Option<&Armature> {
        match &self.kind {
            ObjectKind::Armature(armature) => Some(armature),
            _ => None,
        }
    }

    pub fn armature_mut(&mut self) -> Option<&mut Armature> {
        match &mut self.kind {
            ObjectKind::Armature(armature) => Some(armature),
            _ => None,
        }
    }

    pub fn is_armature(&self) -> bool {
        matches!(self.kind, ObjectKind::Armature(_))
    }

    pub fn is_mesh(&self) -> bool {
        matches!(self.kind, ObjectKind::Mesh)
    }
}

/// Objects produced by importing one file. Parents refer to positions inside
/// `objects`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportedScene {
    #[serde(default)]
    pub source: PathBuf,
    pub objects: Vec<ImportedObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedObject {
    pub name: String,
    pub parent: Option<usize>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub kind: ObjectKind,
}

/// Explicit scene-graph handle threaded through every pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    objects: BTreeMap<ObjectId, SceneObject>,
    next_id: u32,
    pub frame_current: i32,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_id: 0,
            frame_current: DEFAULT_FRAME,
        }
    }
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: SceneObject) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, object);
        id
    }

    /// Adds every object of an import and returns their ids in file order.
    pub fn merge(&mut self, imported: ImportedScene) -> Vec<ObjectId> {
        let base = self.next_id;
        let count = imported.objects.len() as u32;
        let ids: Vec<ObjectId> = (0..count).map(|i| ObjectId(base + i)).collect();

        for (index, object) in imported.objects.into_iter().enumerate() {
            let parent = object
                .parent
                .filter(|p| *p < ids.len() && *p != index)
                .map(|p| ids[p]);
            self.objects.insert(
                ids[index],
                SceneObject {
                    name: object.name,
                    parent,
                    properties: object.properties,
                    kind: object.kind,
                },
            );
        }
        self.next_id = base + count;
        ids
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SceneObject)> {
        self.objects.iter().map(|(id, object)| (*id, object))
    }

    /// Armature ids among `ids`, preserving their order.
    pub fn armatures(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        ids.iter()
            .copied()
            .filter(|id| self.get(*id).map(SceneObject::is_armature).unwrap_or(false))
            .collect()
    }

    pub fn children(&self, parent: ObjectId) -> Vec<ObjectId> {
        self.iter()
            .filter(|(_, object)| object.parent == Some(parent))
            .map(|(id, _)| id)
            .collect()
    }

    /// Direct mesh children of `parent`.
    pub fn mesh_children(&self, parent: ObjectId) -> Vec<ObjectId> {
        self.iter()
            .filter(|(_, object)| object.parent == Some(parent) && object.is_mesh())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn armature(&self, id: ObjectId) -> Option<&Armature> {
        self.get(id).and_then(SceneObject::armature)
    }

    pub fn armature_mut(&mut self, id: ObjectId) -> Option<&mut Armature> {
        self.get_mut(id).and_then(SceneObject::armature_mut)
    }

    /// Removes an object and, recursively, everything parented to it.
    /// Returns the removed objects; an unknown id removes nothing.
    pub fn remove(&mut self, id: ObjectId) -> Vec<SceneObject> {
        let mut removed = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            pending.extend(self.children(next));
            if let Some(object) = self.objects.remove(&next) {
                removed.push(object);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imported(objects: Vec<ImportedObject>) -> ImportedScene {
        ImportedScene {
            source: PathBuf::from("rig.fbx"),
            objects,
        }
    }

    fn object(name: &str, parent: Option<usize>, kind: ObjectKind) -> ImportedObject {
        ImportedObject {
            name: name.to_string(),
            parent,
            properties: BTreeMap::new(),
            kind,
        }
    }

    #[test]
    fn merge_remaps_parents_to_scene_ids() {
        let mut scene = Scene::new();
        scene.insert(SceneObject::new("Camera", ObjectKind::Other));

        let ids = scene.merge(imported(vec![
            object("Armature", None, ObjectKind::Armature(Armature::default())),
            object("Body", Some(0), ObjectKind::Mesh),
        ]));

        assert_eq!(ids.len(), 2);
        assert_eq!(scene.get(ids[1]).unwrap().parent, Some(ids[0]));
        assert_eq!(scene.mesh_children(ids[0]), vec![ids[1]]);
        assert_eq!(scene.armatures(&ids), vec![ids[0]]);
    }

    #[test]
    fn remove_takes_children_with_it() {
        let mut scene = Scene::new();
        let ids = scene.merge(imported(vec![
            object("Armature", None, ObjectKind::Armature(Armature::default())),
            object("Body", Some(0), ObjectKind::Mesh),
            object("Lamp", None, ObjectKind::Other),
        ]));

        let removed = scene.remove(ids[0]);
        assert_eq!(removed.len(), 2);
        assert!(!scene.contains(ids[1]));
        assert!(scene.contains(ids[2]));
        assert!(scene.remove(ids[0]).is_empty());
    }
}
