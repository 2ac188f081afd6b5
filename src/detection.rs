use anyhow::Result;
use nalgebra::Point2;
use num_traits::cast::ToPrimitive;
use opencv::{
    core::{self, Mat, Size, CV_32F},
    imgproc,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{Device, IValue, Kind, Tensor};

use crate::error::TrackingError;
use crate::utils;

/// Keypoint layout of the 7-point rodent pose model:
/// nose, ears, body center, then three tail points.
pub const KEYPOINT_NAMES: [&str; 7] = ["N", "LEar", "REar", "BC", "TB", "TM", "TT"];

/// Anatomical subset used to localize the animal from pose output.
pub const HEAD_KEYPOINT_NAMES: [&str; 4] = ["N", "LEar", "REar", "BC"];

/// Minimum per-keypoint confidence for a keypoint to count as visible.
pub const KEYPOINT_VISIBILITY_THRESHOLD: f32 = 0.5;

/// Tolerance for mask-outline simplification, as a fraction of the contour
/// perimeter.
const OUTLINE_TOLERANCE_FRAC: f64 = 0.005;

/// What the model artifact produces. Resolved once at load time, never per
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Segmentation,
    Pose,
    Detection,
}

impl ModelKind {
    /// Infer the kind from the artifact file name ("pose"/"seg" markers),
    /// the convention the model zoo uses.
    pub fn from_artifact_name(path: &str) -> Self {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("pose") {
            ModelKind::Pose
        } else if name.contains("seg") {
            ModelKind::Segmentation
        } else {
            ModelKind::Detection
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// Payload of one detection hypothesis.
#[derive(Debug)]
pub enum DetectionPayload {
    /// Occupancy mask at model resolution (probabilities or binary).
    Mask(Mat),
    /// Corner-form box [x1, y1, x2, y2] in frame pixels.
    Box([f32; 4]),
    Keypoints(Vec<Keypoint>),
}

/// One detection hypothesis from the primary model for a single frame.
#[derive(Debug)]
pub struct RawDetection {
    pub confidence: f32,
    pub payload: DetectionPayload,
}

/// The single boundary the pipeline depends on: given a frame, zero or more
/// detections. Tests substitute fakes; production uses [`TorchModel`].
pub trait DetectionModel {
    fn kind(&self) -> ModelKind;
    fn infer(&self, frame: &Mat) -> Result<Vec<RawDetection>>;
}

/// Pick the best detection by confidence. Exact ties keep the lowest
/// original index.
pub fn select_candidate(detections: &[RawDetection]) -> Option<&RawDetection> {
    let mut best: Option<&RawDetection> = None;
    for det in detections {
        match best {
            Some(current) if det.confidence <= current.confidence => {}
            _ => best = Some(det),
        }
    }
    best
}

/// Serializable extra carried in a frame record alongside the position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidatePayload {
    MaskOutline { points: Vec<[f32; 2]> },
    Keypoints { keypoints: Vec<Keypoint> },
    BoundingBox { tlbr: [f32; 4] },
}

pub struct ResolvedCandidate {
    pub position: Point2<f32>,
    pub payload: Option<CandidatePayload>,
}

/// Reduce a detection to a single point estimate. A candidate whose payload
/// cannot produce a point (empty mask, no visible head keypoints) is
/// discarded, which sends the frame to the fallback tier.
pub fn candidate_position(
    candidate: &RawDetection,
    frame: &Mat,
) -> Result<Option<ResolvedCandidate>> {
    match &candidate.payload {
        DetectionPayload::Mask(mask) => {
            let mut resized = Mat::default();
            imgproc::resize(
                mask,
                &mut resized,
                frame.size()?,
                0.0,
                0.0,
                imgproc::INTER_NEAREST,
            )?;

            let mut thresholded = Mat::default();
            imgproc::threshold(&resized, &mut thresholded, 0.5, 255.0, imgproc::THRESH_BINARY)?;
            let mut binary = Mat::default();
            thresholded.convert_to(&mut binary, core::CV_8U, 1.0, 0.0)?;

            let position = match utils::centroid_of_mask(&binary)? {
                Some(p) => p,
                None => return Ok(None),
            };

            // Simplified outline for downstream visualization; not part of
            // the centroid computation.
            let payload = match utils::largest_contour(&binary)? {
                Some(contour) => Some(CandidatePayload::MaskOutline {
                    points: utils::simplify_contour(&contour, OUTLINE_TOLERANCE_FRAC)?,
                }),
                None => None,
            };

            Ok(Some(ResolvedCandidate { position, payload }))
        }
        DetectionPayload::Box(tlbr) => {
            let position = Point2::new((tlbr[0] + tlbr[2]) / 2.0, (tlbr[1] + tlbr[3]) / 2.0);
            Ok(Some(ResolvedCandidate {
                position,
                payload: Some(CandidatePayload::BoundingBox { tlbr: *tlbr }),
            }))
        }
        DetectionPayload::Keypoints(keypoints) => {
            let visible: Vec<Keypoint> = keypoints
                .iter()
                .filter(|kp| HEAD_KEYPOINT_NAMES.contains(&kp.name.as_str()))
                .filter(|kp| kp.confidence > KEYPOINT_VISIBILITY_THRESHOLD)
                .cloned()
                .collect();

            if visible.is_empty() {
                return Ok(None);
            }

            let n = visible.len() as f32;
            let position = Point2::new(
                visible.iter().map(|kp| kp.x).sum::<f32>() / n,
                visible.iter().map(|kp| kp.y).sum::<f32>() / n,
            );

            Ok(Some(ResolvedCandidate {
                position,
                payload: Some(CandidatePayload::Keypoints { keypoints: visible }),
            }))
        }
    }
}

/// TorchScript detector. Wraps a traced YOLO-style model; the output parsing
/// depends on the artifact's declared kind.
pub struct TorchModel {
    model: tch::CModule,
    device: Device,
    kind: ModelKind,
    input_size: (i64, i64),
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl TorchModel {
    pub fn load(
        model_path: &str,
        kind: ModelKind,
        device: &str,
        input_size: (i64, i64),
        conf_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Self, TrackingError> {
        let device = if device == "cuda" && tch::Cuda::is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        };

        let model = tch::CModule::load(model_path).map_err(|e| TrackingError::ModelLoad {
            path: model_path.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            model,
            device,
            kind,
            input_size,
            conf_threshold,
            iou_threshold,
        })
    }

    /// Resize, BGR->RGB, normalize to [0,1], NCHW float tensor.
    fn preprocess(&self, frame: &Mat) -> Result<Tensor> {
        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(self.input_size.0 as i32, self.input_size.1 as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&resized, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let mut float_mat = Mat::default();
        rgb.convert_to(&mut float_mat, CV_32F, 1.0 / 255.0, 0.0)?;

        let rows = float_mat.rows();
        let cols = float_mat.cols();
        let channels = float_mat.channels();
        let total_elements = (rows * cols * channels) as usize;
        let data =
            unsafe { std::slice::from_raw_parts(float_mat.data() as *const f32, total_elements) };

        let tensor = Tensor::from_slice(data)
            .reshape(&[1, channels as i64, rows as i64, cols as i64])
            .to_device(self.device)
            .to_kind(Kind::Float);

        Ok(tensor)
    }

    /// Parse [1, N, 6] rows of [x, y, w, h, conf, cls] into boxes scaled to
    /// frame coordinates, with NMS.
    fn parse_boxes(&self, output: &Tensor, orig_size: (i32, i32)) -> Result<Vec<RawDetection>> {
        let output = output.to_device(Device::Cpu);
        let shape = output.size();
        if shape.len() != 3 {
            return Ok(Vec::new());
        }

        let scale_w = orig_size.0 as f32 / self.input_size.0 as f32;
        let scale_h = orig_size.1 as f32 / self.input_size.1 as f32;

        let mut boxes = Vec::new();
        let mut scores = Vec::new();
        for i in 0..shape[1] {
            let row = output.get(0).get(i);
            let conf = row.get(4).double_value(&[]).to_f32().unwrap_or(0.0);
            if conf < self.conf_threshold {
                continue;
            }

            let x = row.get(0).double_value(&[]) as f32;
            let y = row.get(1).double_value(&[]) as f32;
            let w = row.get(2).double_value(&[]) as f32;
            let h = row.get(3).double_value(&[]) as f32;

            boxes.push([
                x * scale_w,
                y * scale_h,
                (x + w) * scale_w,
                (y + h) * scale_h,
            ]);
            scores.push(conf);
        }

        let keep = utils::nms(&boxes, &scores, self.iou_threshold);
        Ok(keep
            .into_iter()
            .map(|i| RawDetection {
                confidence: scores[i],
                payload: DetectionPayload::Box(boxes[i]),
            })
            .collect())
    }

    /// Parse [1, N, 5 + 3K] rows of box + conf + (x, y, conf) keypoint
    /// triples, scaled to frame coordinates.
    fn parse_keypoints(&self, output: &Tensor, orig_size: (i32, i32)) -> Result<Vec<RawDetection>> {
        let output = output.to_device(Device::Cpu);
        let shape = output.size();
        if shape.len() != 3 || shape[2] < 5 + 3 * KEYPOINT_NAMES.len() as i64 {
            return Ok(Vec::new());
        }

        let scale_w = orig_size.0 as f32 / self.input_size.0 as f32;
        let scale_h = orig_size.1 as f32 / self.input_size.1 as f32;

        let mut detections = Vec::new();
        for i in 0..shape[1] {
            let row = output.get(0).get(i);
            let conf = row.get(4).double_value(&[]).to_f32().unwrap_or(0.0);
            if conf < self.conf_threshold {
                continue;
            }

            let mut keypoints = Vec::with_capacity(KEYPOINT_NAMES.len());
            for (k, name) in KEYPOINT_NAMES.iter().enumerate() {
                let base = 5 + 3 * k as i64;
                keypoints.push(Keypoint {
                    name: name.to_string(),
                    x: row.get(base).double_value(&[]) as f32 * scale_w,
                    y: row.get(base + 1).double_value(&[]) as f32 * scale_h,
                    confidence: row.get(base + 2).double_value(&[]) as f32,
                });
            }

            detections.push(RawDetection {
                confidence: conf,
                payload: DetectionPayload::Keypoints(keypoints),
            });
        }

        Ok(detections)
    }

    /// Parse a (detections [1, N, 6], masks [N, Hm, Wm]) tuple from a traced
    /// segmentation model into per-detection probability masks.
    fn parse_masks(&self, output: &IValue) -> Result<Vec<RawDetection>> {
        let (dets, masks) = match output {
            IValue::Tuple(items) if items.len() == 2 => match (&items[0], &items[1]) {
                (IValue::Tensor(dets), IValue::Tensor(masks)) => (dets, masks),
                _ => return Ok(Vec::new()),
            },
            _ => return Ok(Vec::new()),
        };

        let dets = dets.to_device(Device::Cpu);
        let masks = masks.to_device(Device::Cpu);
        let det_shape = dets.size();
        let mask_shape = masks.size();
        if det_shape.len() != 3 || mask_shape.len() != 3 {
            return Ok(Vec::new());
        }

        let (mask_h, mask_w) = (mask_shape[1], mask_shape[2]);
        let mut detections = Vec::new();

        for i in 0..det_shape[1].min(mask_shape[0]) {
            let conf = dets.get(0).get(i).get(4).double_value(&[]).to_f32().unwrap_or(0.0);
            if conf < self.conf_threshold {
                continue;
            }

            let flat =
                Vec::<f32>::try_from(&masks.get(i).contiguous().view([-1]).to_kind(Kind::Float))?;
            let mat = Mat::from_slice(&flat)?;
            let mask = mat.reshape(1, mask_h as i32)?.try_clone()?;
            debug_assert_eq!(mask.cols(), mask_w as i32);

            detections.push(RawDetection {
                confidence: conf,
                payload: DetectionPayload::Mask(mask),
            });
        }

        Ok(detections)
    }
}

impl DetectionModel for TorchModel {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn infer(&self, frame: &Mat) -> Result<Vec<RawDetection>> {
        let orig_size = (frame.cols(), frame.rows());
        let input = self.preprocess(frame)?;

        match self.kind {
            ModelKind::Detection => {
                let output = self.model.forward_ts(&[&input])?;
                self.parse_boxes(&output, orig_size)
            }
            ModelKind::Pose => {
                let output = self.model.forward_ts(&[&input])?;
                self.parse_keypoints(&output, orig_size)
            }
            ModelKind::Segmentation => {
                let output = self.model.forward_is(&[IValue::from(input)])?;
                self.parse_masks(&output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use opencv::core::{Rect, Scalar};

    fn boxed(confidence: f32, tlbr: [f32; 4]) -> RawDetection {
        RawDetection {
            confidence,
            payload: DetectionPayload::Box(tlbr),
        }
    }

    #[test]
    fn select_candidate_prefers_max_confidence() {
        let dets = vec![
            boxed(0.3, [0.0, 0.0, 10.0, 10.0]),
            boxed(0.9, [20.0, 20.0, 30.0, 30.0]),
            boxed(0.5, [40.0, 40.0, 50.0, 50.0]),
        ];
        let best = select_candidate(&dets).unwrap();
        assert_relative_eq!(best.confidence, 0.9);
    }

    #[test]
    fn select_candidate_tie_keeps_first() {
        let dets = vec![
            boxed(0.7, [0.0, 0.0, 10.0, 10.0]),
            boxed(0.7, [20.0, 20.0, 30.0, 30.0]),
        ];
        let best = select_candidate(&dets).unwrap();
        match best.payload {
            DetectionPayload::Box(tlbr) => assert_relative_eq!(tlbr[0], 0.0),
            _ => panic!("expected box payload"),
        }
    }

    #[test]
    fn select_candidate_empty_is_none() {
        assert!(select_candidate(&[]).is_none());
    }

    fn gray_frame(width: i32, height: i32) -> Mat {
        Mat::new_size_with_default(Size::new(width, height), core::CV_8UC1, Scalar::all(0.0))
            .unwrap()
    }

    #[test]
    fn box_position_is_center() {
        let frame = gray_frame(200, 200);
        let det = boxed(0.8, [10.0, 20.0, 30.0, 60.0]);
        let resolved = candidate_position(&det, &frame).unwrap().unwrap();
        assert_relative_eq!(resolved.position.x, 20.0);
        assert_relative_eq!(resolved.position.y, 40.0);
    }

    fn keypoint(name: &str, x: f32, y: f32, confidence: f32) -> Keypoint {
        Keypoint {
            name: name.to_string(),
            x,
            y,
            confidence,
        }
    }

    #[test]
    fn pose_position_averages_visible_head_keypoints() {
        let frame = gray_frame(200, 200);
        let det = RawDetection {
            confidence: 0.9,
            payload: DetectionPayload::Keypoints(vec![
                keypoint("N", 10.0, 10.0, 0.9),
                keypoint("LEar", 20.0, 10.0, 0.9),
                // Below the visibility threshold: excluded from the mean.
                keypoint("REar", 500.0, 500.0, 0.2),
                // Tail points never contribute.
                keypoint("TT", 900.0, 900.0, 0.99),
            ]),
        };

        let resolved = candidate_position(&det, &frame).unwrap().unwrap();
        assert_relative_eq!(resolved.position.x, 15.0);
        assert_relative_eq!(resolved.position.y, 10.0);

        match resolved.payload.unwrap() {
            CandidatePayload::Keypoints { keypoints } => assert_eq!(keypoints.len(), 2),
            _ => panic!("expected keypoints payload"),
        }
    }

    #[test]
    fn pose_with_no_visible_head_is_discarded() {
        let frame = gray_frame(200, 200);
        let det = RawDetection {
            confidence: 0.9,
            payload: DetectionPayload::Keypoints(vec![
                keypoint("N", 10.0, 10.0, 0.1),
                keypoint("TB", 50.0, 50.0, 0.9),
            ]),
        };
        assert!(candidate_position(&det, &frame).unwrap().is_none());
    }

    #[test]
    fn mask_position_is_centroid_after_resize() {
        // Mask at half the frame resolution; a square at (20..40, 30..50)
        // lands at (40..80, 60..100) in frame pixels, centroid near (60, 80).
        let frame = gray_frame(200, 200);
        let mut mask = Mat::new_size_with_default(
            Size::new(100, 100),
            core::CV_32FC1,
            Scalar::all(0.0),
        )
        .unwrap();
        imgproc::rectangle(
            &mut mask,
            Rect::new(20, 30, 20, 20),
            Scalar::all(1.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let det = RawDetection {
            confidence: 0.8,
            payload: DetectionPayload::Mask(mask),
        };
        let resolved = candidate_position(&det, &frame).unwrap().unwrap();
        assert_relative_eq!(resolved.position.x, 60.0, epsilon = 1.0);
        assert_relative_eq!(resolved.position.y, 80.0, epsilon = 1.0);

        assert!(matches!(
            resolved.payload,
            Some(CandidatePayload::MaskOutline { .. })
        ));
    }

    #[test]
    fn empty_mask_is_discarded() {
        let frame = gray_frame(200, 200);
        let mask = Mat::new_size_with_default(
            Size::new(100, 100),
            core::CV_32FC1,
            Scalar::all(0.0),
        )
        .unwrap();
        let det = RawDetection {
            confidence: 0.8,
            payload: DetectionPayload::Mask(mask),
        };
        assert!(candidate_position(&det, &frame).unwrap().is_none());
    }

    #[test]
    fn model_kind_from_artifact_name() {
        assert_eq!(
            ModelKind::from_artifact_name("models/mouse-pose-v2.pt"),
            ModelKind::Pose
        );
        assert_eq!(
            ModelKind::from_artifact_name("models/mouse_seg.torchscript"),
            ModelKind::Segmentation
        );
        assert_eq!(
            ModelKind::from_artifact_name("models/yolov8n.pt"),
            ModelKind::Detection
        );
    }
}
