//! Render settings, loadable from JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a `render` or `bench` run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    // Image
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub bounces: u32,
    pub gamma: f32,

    // Scene
    pub scene: String,
    pub instances: usize,
    pub background: [f32; 3],

    // Device
    pub platform: String,
    pub seed: Option<u64>,

    // Accelerator
    pub builder: String,
    pub use_splits: bool,

    // Output
    pub output: PathBuf,
    pub aovs: Vec<String>,

    // Benchmark
    pub bench_passes: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            samples: 16,
            bounces: 5,
            gamma: 2.2,
            scene: "cornell".to_string(),
            instances: 16,
            background: [0.0, 0.0, 0.0],
            platform: "host".to_string(),
            seed: None,
            builder: "sah".to_string(),
            use_splits: false,
            output: PathBuf::from("render.png"),
            aovs: Vec::new(),
            bench_passes: 8,
        }
    }
}

impl RenderSettings {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing settings {}", path.display()))
    }

    /// Path of the image for one AOV: `<stem>_<aov>.<ext>` next to `output`.
    pub fn aov_path(&self, aov: &str) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("render");
        let ext = self.output.extension().and_then(|s| s.to_str()).unwrap_or("png");
        self.output.with_file_name(format!("{}_{}.{}", stem, aov, ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let s: RenderSettings = serde_json::from_str(r#"{ "width": 64, "aovs": ["albedo"] }"#).unwrap();
        assert_eq!(s.width, 64);
        assert_eq!(s.height, 256);
        assert_eq!(s.aovs, vec!["albedo".to_string()]);
        assert_eq!(s.scene, "cornell");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = RenderSettings {
            samples: 3,
            seed: Some(42),
            use_splits: true,
            ..Default::default()
        };
        s.save(&path).unwrap();
        assert_eq!(RenderSettings::load(&path).unwrap(), s);
        assert!(RenderSettings::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_aov_path() {
        let s = RenderSettings {
            output: PathBuf::from("out/frame.png"),
            ..Default::default()
        };
        assert_eq!(s.aov_path("depth"), PathBuf::from("out/frame_depth.png"));
    }
}
