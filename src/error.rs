use thiserror::Error;

/// Run-level failures. Per-frame detector errors are recovered inside the
/// pipeline and never surface through this type.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("could not open video source: {0}")]
    VideoOpen(String),

    #[error("background estimation unavailable: {0}")]
    BackgroundUnavailable(String),

    #[error("could not load detection model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}
