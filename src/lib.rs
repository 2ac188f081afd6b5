pub mod analysis;
pub mod background;
pub mod config;
pub mod detection;
pub mod error;
pub mod fallback;
pub mod pipeline;
pub mod roi;
pub mod utils;
pub mod video;
pub mod visualization;

// Re-export main types
pub use crate::background::BackgroundModel;
pub use crate::config::TrackingConfig;
pub use crate::detection::{DetectionModel, ModelKind, RawDetection, TorchModel};
pub use crate::error::TrackingError;
pub use crate::pipeline::{CancelToken, FramePipeline, FrameRecord, RunStatistics, TrackingResult};
pub use crate::roi::{Roi, RoiCollection, RoiPreset, RoiShape};
pub use crate::video::{FrameSource, VideoFile};
