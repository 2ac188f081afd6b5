use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};
use std::ops::Range;
use tracing::{debug, info};

use crate::error::TrackingError;
use crate::video::FrameSource;

pub const DEFAULT_SAMPLE_COUNT: usize = 200;

/// Reference frame approximating the static scene without the animal.
/// Computed once before tracking starts and read-only for the rest of the
/// run; slow lighting drift across a long recording is not compensated.
pub struct BackgroundModel {
    frame: Mat,
    sample_count: usize,
}

impl BackgroundModel {
    /// Grayscale reference frame, same dimensions as the source video.
    pub fn frame(&self) -> &Mat {
        &self.frame
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Build a background model by averaging sampled frames. `window`
    /// restricts sampling to a sub-range of frame indices (useful to skip
    /// the start/end of a recording where the experimenter's hand is
    /// visible); `None` samples the whole video.
    pub fn estimate(
        source: &mut dyn FrameSource,
        sample_count: usize,
        window: Option<Range<usize>>,
    ) -> Result<Self, TrackingError> {
        let total = source.frame_count();
        let window = window.unwrap_or(0..total);
        let window_len = window.end.saturating_sub(window.start);

        if sample_count == 0 || window_len == 0 {
            return Err(TrackingError::BackgroundUnavailable(
                "empty sampling window".to_string(),
            ));
        }

        let frame_step = (window_len / sample_count).max(1);
        debug!(
            window_start = window.start,
            window_len, frame_step, "sampling frames for background"
        );

        source
            .seek(window.start)
            .map_err(|e| TrackingError::BackgroundUnavailable(e.to_string()))?;

        let mut accumulator = Mat::default();
        let mut sampled = 0usize;
        let mut index = window.start;

        while sampled < sample_count && index < window.end {
            let frame = match source.read_next() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(TrackingError::BackgroundUnavailable(e.to_string())),
            };

            if (index - window.start) % frame_step == 0 {
                let gray = to_gray(&frame)?;
                if accumulator.empty() {
                    accumulator = Mat::zeros(gray.rows(), gray.cols(), core::CV_32FC1)?.to_mat()?;
                }
                // 32-bit accumulation avoids overflow across hundreds of
                // 8-bit additions.
                imgproc::accumulate(&gray, &mut accumulator, &core::no_array())?;
                sampled += 1;
            }

            index += 1;
        }

        if sampled == 0 {
            return Err(TrackingError::BackgroundUnavailable(
                "no frames could be sampled".to_string(),
            ));
        }

        let mut background = Mat::default();
        accumulator.convert_to(&mut background, core::CV_8U, 1.0 / sampled as f64, 0.0)?;

        info!(samples = sampled, "background model computed");

        Ok(Self {
            frame: background,
            sample_count: sampled,
        })
    }
}

fn to_gray(frame: &Mat) -> Result<Mat, opencv::Error> {
    if frame.channels() == 1 {
        return frame.try_clone();
    }
    let mut gray = Mat::default();
    imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
    Ok(gray)
}
