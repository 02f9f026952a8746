//! Viewer settings: defaults, optionally overridden by a JSON file and
//! then by command-line flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `Layer_*.layer` files.
    pub layer_dir: PathBuf,
    /// Where screenshots are written.
    pub export_path: PathBuf,
    pub channel: String,
    pub stride: usize,
    pub point_size: f32,
    pub value_min: f32,
    pub value_max: f32,
    /// Histogram bins for the chart; `None` keeps exact values.
    pub histogram_bins: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            layer_dir: PathBuf::from("layer_files"),
            export_path: PathBuf::from("output_capture.png"),
            channel: "channel_1".to_string(),
            stride: 10,
            point_size: 3.0,
            value_min: 1000.0,
            value_max: 4000.0,
            histogram_bins: Some(256),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        log::debug!("loaded settings from {}", path.display());
        Ok(settings.sanitized())
    }

    /// `load` when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Clamps values the viewer cannot use.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.stride == 0 {
            self.stride = 1;
        }
        if !(self.point_size.is_finite() && self.point_size > 0.0) {
            log::warn!("ignoring point size {}", self.point_size);
            self.point_size = defaults.point_size;
        }
        if !(self.value_min.is_finite() && self.value_max.is_finite()) {
            self.value_min = defaults.value_min;
            self.value_max = defaults.value_max;
        }
        if self.histogram_bins == Some(0) {
            self.histogram_bins = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_viewer_startup() {
        let s = Settings::default();
        assert_eq!(s.point_size, 3.0);
        assert_eq!((s.value_min, s.value_max), (1000.0, 4000.0));
        assert_eq!(s.stride, 10);
        assert_eq!(s.channel, "channel_1");
        assert_eq!(s.layer_dir, PathBuf::from("layer_files"));
        assert_eq!(s.export_path, PathBuf::from("output_capture.png"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wavecloud.json");
        std::fs::write(&path, r#"{ "channel": "channel_3", "stride": 0, "point_size": -1 }"#).unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.channel, "channel_3");
        assert_eq!(s.stride, 1);
        assert_eq!(s.point_size, 3.0);
        assert_eq!(s.value_max, 4000.0);
    }

    #[test]
    fn written_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::default();
        s.histogram_bins = None;
        s.layer_dir = dir.path().to_path_buf();
        std::fs::write(&path, serde_json::to_string_pretty(&s).unwrap()).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
    }

    #[test]
    fn bad_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(&dir.path().join("missing.json")).is_err());
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse"));
        assert_eq!(Settings::load_or_default(None).unwrap(), Settings::default());
    }
}
