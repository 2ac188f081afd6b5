use anyhow::Result;
use nalgebra::Point2;
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::background::BackgroundModel;
use crate::detection::{candidate_position, select_candidate, CandidatePayload, DetectionModel};
use crate::fallback;
use crate::roi::RoiCollection;
use crate::video::FrameSource;

/// Provenance of a frame's position estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Primary,
    Fallback,
    None,
}

/// Per-frame output record. Emitted exactly once per processed frame, in
/// frame order, including frames where both detection tiers failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_number: usize,
    pub position: Option<[f32; 2]>,
    pub roi: Option<String>,
    pub roi_index: Option<usize>,
    pub method: DetectionMethod,
    pub timestamp_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<CandidatePayload>,
}

/// Run-level counts by detection method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunStatistics {
    pub primary: usize,
    pub fallback: usize,
    pub none: usize,
    pub detection_rate: f64,
}

impl RunStatistics {
    pub fn from_records(records: &[FrameRecord]) -> Self {
        let mut primary = 0;
        let mut fallback = 0;
        let mut none = 0;
        for record in records {
            match record.method {
                DetectionMethod::Primary => primary += 1,
                DetectionMethod::Fallback => fallback += 1,
                DetectionMethod::None => none += 1,
            }
        }
        let total = records.len();
        let detection_rate = if total > 0 {
            (primary + fallback) as f64 / total as f64
        } else {
            0.0
        };
        Self {
            primary,
            fallback,
            none,
            detection_rate,
        }
    }

    pub fn total(&self) -> usize {
        self.primary + self.fallback + self.none
    }
}

/// Cooperative stop signal, checked once per frame. A cancelled run
/// finalizes normally with partial results.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Complete output of one tracking run.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrackingResult {
    pub total_frames: usize,
    pub fps: f64,
    pub background_available: bool,
    pub rois: RoiCollection,
    pub statistics: RunStatistics,
    pub frames: Vec<FrameRecord>,
}

/// Per-frame orchestrator: primary detection with fallback to background
/// subtraction, ROI resolution, record accumulation. Owns its run state;
/// independent runs share nothing.
pub struct FramePipeline {
    model: Box<dyn DetectionModel>,
    background: Option<BackgroundModel>,
    rois: RoiCollection,
    fallback_threshold: i32,
}

impl FramePipeline {
    /// `rois` is snapshotted here; edits to the caller's collection after
    /// this point do not affect the run.
    pub fn new(
        model: Box<dyn DetectionModel>,
        background: Option<BackgroundModel>,
        rois: RoiCollection,
    ) -> Self {
        Self {
            model,
            background,
            rois,
            fallback_threshold: fallback::DEFAULT_DIFF_THRESHOLD,
        }
    }

    pub fn with_fallback_threshold(mut self, threshold: i32) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    /// Process the whole source, one frame at a time, until it is exhausted
    /// or `cancel` is signaled. Single-frame detector failures degrade that
    /// frame, never the run.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        cancel: &CancelToken,
    ) -> Result<TrackingResult> {
        let total_frames = source.frame_count();
        let fps = source.fps();
        let (width, height) = source.frame_size();

        let roi_mask = match self.rois.rasterize(width, height) {
            Ok(mask) => mask,
            Err(e) => {
                warn!("could not rasterize ROI mask, fallback runs unmasked: {e}");
                None
            }
        };

        info!(
            total_frames,
            rois = self.rois.len(),
            background = self.background.is_some(),
            "starting tracking run"
        );

        let mut records: Vec<FrameRecord> = Vec::new();
        let mut frame_number = 0usize;

        loop {
            if cancel.is_cancelled() {
                info!(frames = records.len(), "run cancelled, finalizing partial results");
                break;
            }

            let frame = match source.read_next()? {
                Some(frame) => frame,
                None => break,
            };

            records.push(self.process_frame(&frame, frame_number, fps, roi_mask.as_ref()));
            frame_number += 1;

            if frame_number % 100 == 0 {
                debug!(frame_number, total_frames, "progress");
            }
        }

        let statistics = RunStatistics::from_records(&records);
        info!(
            primary = statistics.primary,
            fallback = statistics.fallback,
            none = statistics.none,
            rate = statistics.detection_rate,
            "run complete"
        );

        Ok(TrackingResult {
            total_frames,
            fps,
            background_available: self.background.is_some(),
            rois: self.rois.clone(),
            statistics,
            frames: records,
        })
    }

    /// TRY_PRIMARY -> TRY_FALLBACK -> DONE, always producing a record.
    fn process_frame(
        &self,
        frame: &Mat,
        frame_number: usize,
        fps: f64,
        roi_mask: Option<&Mat>,
    ) -> FrameRecord {
        let mut method = DetectionMethod::None;
        let mut position: Option<Point2<f32>> = None;
        let mut payload: Option<CandidatePayload> = None;

        match self.model.infer(frame) {
            Ok(detections) => {
                if let Some(best) = select_candidate(&detections) {
                    match candidate_position(best, frame) {
                        Ok(Some(resolved)) => {
                            position = Some(resolved.position);
                            payload = resolved.payload;
                            method = DetectionMethod::Primary;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(frame_number, "candidate normalization failed: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(frame_number, "primary detection failed: {e}");
            }
        }

        if position.is_none() {
            if let Some(background) = &self.background {
                match fallback::detect(frame, background, roi_mask, self.fallback_threshold) {
                    Ok(Some(point)) => {
                        position = Some(point);
                        method = DetectionMethod::Fallback;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(frame_number, "fallback detection failed: {e}");
                    }
                }
            }
        }

        let (roi_index, roi) = match position.and_then(|p| self.rois.resolve(p)) {
            Some((idx, roi)) => (Some(idx), Some(roi.name.clone())),
            None => (None, None),
        };

        FrameRecord {
            frame_number,
            position: position.map(|p| [p.x, p.y]),
            roi,
            roi_index,
            method,
            timestamp_sec: if fps > 0.0 {
                frame_number as f64 / fps
            } else {
                0.0
            },
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionPayload, ModelKind, RawDetection};
    use crate::roi::{Roi, RoiShape};
    use opencv::core::{self, Rect, Scalar, Size};
    use opencv::imgproc;
    use opencv::prelude::*;
    use std::cell::RefCell;

    /// Scripted stand-in for the learned model.
    enum Step {
        Detections(Vec<RawDetection>),
        Nothing,
        Fail,
    }

    struct FakeModel {
        steps: RefCell<Vec<Step>>,
        cursor: RefCell<usize>,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl FakeModel {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: RefCell::new(steps),
                cursor: RefCell::new(0),
                cancel_after: None,
            }
        }

        fn cancelling(calls: usize, token: CancelToken) -> Self {
            Self {
                steps: RefCell::new(Vec::new()),
                cursor: RefCell::new(0),
                cancel_after: Some((calls, token)),
            }
        }
    }

    impl DetectionModel for FakeModel {
        fn kind(&self) -> ModelKind {
            ModelKind::Detection
        }

        fn infer(&self, _frame: &Mat) -> Result<Vec<RawDetection>> {
            let mut cursor = self.cursor.borrow_mut();
            *cursor += 1;

            if let Some((calls, token)) = &self.cancel_after {
                if *cursor >= *calls {
                    token.cancel();
                }
                return Ok(vec![RawDetection {
                    confidence: 0.9,
                    payload: DetectionPayload::Box([10.0, 10.0, 20.0, 20.0]),
                }]);
            }

            let mut steps = self.steps.borrow_mut();
            if steps.is_empty() {
                return Ok(Vec::new());
            }
            match steps.remove(0) {
                Step::Detections(dets) => Ok(dets),
                Step::Nothing => Ok(Vec::new()),
                Step::Fail => anyhow::bail!("model exploded"),
            }
        }
    }

    /// Gray frames with a bright square so the fallback tier can find
    /// something.
    struct BlobSource {
        frames: usize,
        cursor: usize,
        with_blob: bool,
    }

    impl BlobSource {
        fn new(frames: usize, with_blob: bool) -> Self {
            Self {
                frames,
                cursor: 0,
                with_blob,
            }
        }
    }

    impl FrameSource for BlobSource {
        fn frame_count(&self) -> usize {
            self.frames
        }
        fn fps(&self) -> f64 {
            30.0
        }
        fn frame_size(&self) -> (i32, i32) {
            (200, 200)
        }

        fn read_next(&mut self) -> Result<Option<Mat>> {
            if self.cursor >= self.frames {
                return Ok(None);
            }
            self.cursor += 1;
            let mut frame = Mat::new_size_with_default(
                Size::new(200, 200),
                core::CV_8UC1,
                Scalar::all(20.0),
            )?;
            if self.with_blob {
                imgproc::rectangle(
                    &mut frame,
                    Rect::new(80, 60, 21, 21),
                    Scalar::all(220.0),
                    -1,
                    imgproc::LINE_8,
                    0,
                )?;
            }
            Ok(Some(frame))
        }

        fn seek(&mut self, index: usize) -> Result<()> {
            self.cursor = index;
            Ok(())
        }
    }

    fn plain_background() -> BackgroundModel {
        let mut source = BlobSource::new(1, false);
        BackgroundModel::estimate(&mut source, 1, None).unwrap()
    }

    fn arena_roi() -> RoiCollection {
        let mut rois = RoiCollection::new();
        rois.push(Roi {
            name: "arena".to_string(),
            center_x: 100.0,
            center_y: 100.0,
            shape: RoiShape::Circle { radius: 150.0 },
        });
        rois
    }

    fn box_detection(confidence: f32) -> RawDetection {
        RawDetection {
            confidence,
            payload: DetectionPayload::Box([80.0, 60.0, 100.0, 80.0]),
        }
    }

    #[test]
    fn primary_success_resolves_roi() {
        let model = FakeModel::new(vec![Step::Detections(vec![box_detection(0.9)])]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(1, false);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.frames.len(), 1);
        let record = &result.frames[0];
        assert_eq!(record.method, DetectionMethod::Primary);
        assert_eq!(record.roi.as_deref(), Some("arena"));
        assert_eq!(record.roi_index, Some(0));
        let pos = record.position.unwrap();
        assert_eq!(pos, [90.0, 70.0]);
    }

    #[test]
    fn primary_miss_falls_back_to_background_subtraction() {
        // Scenario: primary yields nothing for 3 frames, fallback succeeds
        // on all of them.
        let model = FakeModel::new(vec![Step::Nothing, Step::Nothing, Step::Nothing]);
        let mut pipeline =
            FramePipeline::new(Box::new(model), Some(plain_background()), arena_roi());
        let mut source = BlobSource::new(3, true);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.statistics.primary, 0);
        assert_eq!(result.statistics.fallback, 3);
        assert_eq!(result.statistics.none, 0);
        for record in &result.frames {
            assert_eq!(record.method, DetectionMethod::Fallback);
            assert!(record.position.is_some());
        }
    }

    #[test]
    fn model_error_is_recovered_per_frame() {
        let model = FakeModel::new(vec![
            Step::Fail,
            Step::Detections(vec![box_detection(0.9)]),
        ]);
        let mut pipeline =
            FramePipeline::new(Box::new(model), Some(plain_background()), arena_roi());
        let mut source = BlobSource::new(2, true);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.frames.len(), 2);
        // Frame 0: model error -> fallback finds the blob.
        assert_eq!(result.frames[0].method, DetectionMethod::Fallback);
        assert_eq!(result.frames[1].method, DetectionMethod::Primary);
    }

    #[test]
    fn no_background_and_no_primary_emits_none_record() {
        let model = FakeModel::new(vec![Step::Nothing, Step::Fail]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(2, true);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.frames.len(), 2);
        assert!(!result.background_available);
        for record in &result.frames {
            assert_eq!(record.method, DetectionMethod::None);
            assert!(record.position.is_none());
            assert!(record.roi.is_none());
        }
        assert_eq!(result.statistics.none, 2);
        assert_eq!(result.statistics.detection_rate, 0.0);
    }

    #[test]
    fn record_sequence_is_gapless_and_counts_sum() {
        let model = FakeModel::new(vec![
            Step::Detections(vec![box_detection(0.9)]),
            Step::Nothing,
            Step::Fail,
            Step::Detections(vec![box_detection(0.5)]),
        ]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(4, false);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.frames.len(), 4);
        for (i, record) in result.frames.iter().enumerate() {
            assert_eq!(record.frame_number, i);
        }
        assert_eq!(result.statistics.total(), result.frames.len());
    }

    #[test]
    fn cancellation_finalizes_partial_results() {
        // Scenario: cancellation signaled while processing the 10th frame of
        // a 100-frame run -> exactly 10 records, normal completion.
        let token = CancelToken::new();
        let model = FakeModel::cancelling(10, token.clone());
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(100, false);

        let result = pipeline.run(&mut source, &token).unwrap();
        assert_eq!(result.frames.len(), 10);
        assert_eq!(result.statistics.total(), 10);
    }

    #[test]
    fn cancellation_before_start_yields_empty_run() {
        let token = CancelToken::new();
        token.cancel();
        let model = FakeModel::new(vec![]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(10, false);

        let result = pipeline.run(&mut source, &token).unwrap();
        assert!(result.frames.is_empty());
        assert_eq!(result.statistics.total(), 0);
        assert_eq!(result.statistics.detection_rate, 0.0);
    }

    #[test]
    fn best_of_multiple_candidates_wins() {
        let model = FakeModel::new(vec![Step::Detections(vec![
            RawDetection {
                confidence: 0.4,
                payload: DetectionPayload::Box([0.0, 0.0, 10.0, 10.0]),
            },
            RawDetection {
                confidence: 0.8,
                payload: DetectionPayload::Box([100.0, 100.0, 120.0, 120.0]),
            },
        ])]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(1, false);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        assert_eq!(result.frames[0].position.unwrap(), [110.0, 110.0]);
    }

    #[test]
    fn tracking_result_serializes() {
        let model = FakeModel::new(vec![Step::Detections(vec![box_detection(0.9)])]);
        let mut pipeline = FramePipeline::new(Box::new(model), None, arena_roi());
        let mut source = BlobSource::new(1, false);

        let result = pipeline.run(&mut source, &CancelToken::new()).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"method\":\"primary\""));
        let back: TrackingResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frames.len(), 1);
    }
}
