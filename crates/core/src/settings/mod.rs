use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PoseTransferError, Result};

/// Last-used paths remembered between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pose_path: Option<String>,
    pub avatar_path: Option<String>,
    pub export_dir: Option<String>,
    pub engine_path: Option<String>,
    pub output_name: Option<String>,
}

impl Settings {
    /// Reads the settings file. A missing or unreadable file yields empty
    /// defaults; the problem is logged and never returned.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(%err, "ignoring persisted settings");
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path).map_err(|err| settings_error(path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| settings_error(path, err))
    }

    /// Writes the settings file. Callers are expected to log the error only.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|err| settings_error(path, err))?;
        std::fs::write(path, json).map_err(|err| settings_error(path, err))
    }
}

fn settings_error(path: &Path, err: impl std::fmt::Display) -> PoseTransferError {
    PoseTransferError::SettingsIo {
        path: path.display().to_string(),
        diagnostic: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn remembers_paths_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            pose_path: Some("pose.fbx".into()),
            output_name: Some("posed".into()),
            ..Settings::default()
        };

        settings.save(&path).unwrap();

        assert_eq!(Settings::load(&path), settings);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "][").unwrap();

        assert_eq!(Settings::load(&path), Settings::default());
        assert_eq!(Settings::try_load(&path).unwrap_err().kind(), ErrorKind::SettingsIo);
    }

    #[test]
    fn unwritable_location_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let err = Settings::default().save(&blocker.join("settings.json")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SettingsIo);
    }
}
