use std::path::{Path, PathBuf};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, RunContext};
use crate::{PoseTransferError, Result};

pub const PREVIEW_EXTENSION: &str = "png";

/// Area light of the thumbnail rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    pub name: String,
    pub location: Vec3,
    /// Watts.
    pub energy: f32,
}

impl Light {
    pub fn area(name: &str, location: Vec3, energy: f32) -> Self {
        Self {
            name: name.to_string(),
            location,
            energy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub location: Vec3,
    /// XYZ euler angles in radians.
    pub rotation_euler: Vec3,
    pub lens_mm: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            location: Vec3::new(0.0, -2.2, 0.9),
            rotation_euler: Vec3::new(90f32.to_radians(), 0.0, 0.0),
            lens_mm: 35.0,
        }
    }
}

/// Fixed look of the thumbnail: lights, camera and output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSettings {
    pub resolution: [u32; 2],
    pub transparent: bool,
    pub lights: Vec<Light>,
    pub camera: Camera,
    pub reload_textures: bool,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            resolution: [1024, 1024],
            transparent: true,
            lights: three_point_rig(),
            camera: Camera::default(),
            reload_textures: true,
        }
    }
}

/// Key, fill and back area lights.
pub fn three_point_rig() -> Vec<Light> {
    vec![
        Light::area("Key", Vec3::new(3.0, -3.0, 4.0), 1000.0),
        Light::area("Fill", Vec3::new(-3.0, -2.0, 2.0), 500.0),
        Light::area("Back", Vec3::new(0.0, 4.0, 3.0), 750.0),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub artifact: PathBuf,
    pub image: PathBuf,
    pub settings: PreviewSettings,
}

impl PreviewRequest {
    pub fn new(artifact: PathBuf, image: PathBuf, settings: PreviewSettings) -> Self {
        Self {
            artifact,
            image,
            settings,
        }
    }
}

pub fn preview_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{name}.{PREVIEW_EXTENSION}"))
}

/// Renders the thumbnail in a separate engine process that only loads the
/// export artifact.
pub fn render_preview(
    engine: &dyn Engine,
    request: &PreviewRequest,
    ctx: &RunContext,
) -> Result<PathBuf> {
    if !request.artifact.is_file() {
        return Err(PoseTransferError::PreviewRender {
            diagnostic: format!("export artifact `{}` does not exist", request.artifact.display()),
        });
    }

    tracing::info!(
        artifact = %request.artifact.display(),
        image = %request.image.display(),
        "rendering preview"
    );
    engine.render_preview(request, ctx)?;

    if !request.image.is_file() {
        return Err(PoseTransferError::PreviewRender {
            diagnostic: format!(
                "renderer finished but `{}` was not written",
                request.image.display()
            ),
        });
    }
    Ok(request.image.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_fixed_thumbnail() {
        let settings = PreviewSettings::default();

        assert_eq!(settings.resolution, [1024, 1024]);
        assert!(settings.transparent);
        assert!(settings.reload_textures);
        let names: Vec<_> = settings.lights.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Key", "Fill", "Back"]);
        assert_eq!(settings.lights[1].energy, 500.0);
        assert_eq!(settings.camera.lens_mm, 35.0);
        assert!((settings.camera.rotation_euler.x - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: PreviewSettings =
            serde_json::from_str(r#"{"resolution": [256, 256]}"#).unwrap();
        assert_eq!(settings.resolution, [256, 256]);
        assert_eq!(settings.lights.len(), 3);
    }

    #[test]
    fn image_sits_next_to_the_export() {
        assert_eq!(
            preview_path(Path::new("out"), "posed"),
            PathBuf::from("out").join("posed.png")
        );
    }
}
