use serde::Deserialize;
use std::fs;

use crate::detection::ModelKind;

fn default_device() -> String {
    "cpu".to_string()
}

fn default_input_size() -> [i64; 2] {
    [640, 640]
}

fn default_conf_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_background_samples() -> usize {
    crate::background::DEFAULT_SAMPLE_COUNT
}

fn default_fallback_threshold() -> i32 {
    crate::fallback::DEFAULT_DIFF_THRESHOLD
}

#[derive(Debug, Deserialize)]
pub struct TrackingConfig {
    pub model_path: String,
    /// Inferred from the artifact name when absent.
    #[serde(default)]
    pub model_kind: Option<ModelKind>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_input_size")]
    pub input_size: [i64; 2],
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_background_samples")]
    pub background_samples: usize,
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: i32,
}

impl TrackingConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: TrackingConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), crate::error::TrackingError> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(crate::error::TrackingError::Config(format!(
                "conf_threshold must be in [0,1], got {}",
                self.conf_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(crate::error::TrackingError::Config(format!(
                "iou_threshold must be in [0,1], got {}",
                self.iou_threshold
            )));
        }
        Ok(())
    }

    /// Effective model kind: explicit setting, else inferred from the
    /// artifact name.
    pub fn resolved_model_kind(&self) -> ModelKind {
        self.model_kind
            .unwrap_or_else(|| ModelKind::from_artifact_name(&self.model_path))
    }
}
