use anyhow::Result;
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};

use crate::error::TrackingError;

/// Frame-addressable video source. The background estimator and the pipeline
/// only see this trait, so tests can substitute synthetic sources.
pub trait FrameSource {
    fn frame_count(&self) -> usize;
    fn fps(&self) -> f64;
    fn frame_size(&self) -> (i32, i32);

    /// Read the next frame, or `None` once the source is exhausted.
    fn read_next(&mut self) -> Result<Option<Mat>>;

    /// Position the source so the next read returns frame `index`.
    fn seek(&mut self, index: usize) -> Result<()>;
}

/// A video file decoded through OpenCV.
pub struct VideoFile {
    cap: VideoCapture,
    frame_count: usize,
    fps: f64,
    width: i32,
    height: i32,
}

impl VideoFile {
    pub fn open(path: &str) -> Result<Self, TrackingError> {
        let cap = VideoCapture::from_file(path, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(TrackingError::VideoOpen(path.to_string()));
        }

        let frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT)? as usize;
        let fps = cap.get(videoio::CAP_PROP_FPS)?;
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        Ok(Self {
            cap,
            frame_count,
            fps,
            width,
            height,
        })
    }
}

impl FrameSource for VideoFile {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    fn read_next(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn seek(&mut self, index: usize) -> Result<()> {
        self.cap
            .set(videoio::CAP_PROP_POS_FRAMES, index as f64)?;
        Ok(())
    }
}
