use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::FrameRecord;

/// Trajectory statistics over a run. Frame pairs where either frame lacks a
/// position are skipped, so gaps do not produce phantom jumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementSummary {
    pub total_distance: f32,
    pub average_velocity: f32,
    pub max_velocity: f32,
    pub center_of_mass: Option<[f32; 2]>,
    pub frames_analyzed: usize,
}

impl MovementSummary {
    pub fn from_records(records: &[FrameRecord]) -> Self {
        let positions: Vec<(usize, Point2<f32>)> = records
            .iter()
            .filter_map(|r| r.position.map(|p| (r.frame_number, Point2::new(p[0], p[1]))))
            .collect();

        let mut velocities = Vec::new();
        for pair in positions.windows(2) {
            let (prev_frame, prev) = pair[0];
            let (frame, curr) = pair[1];
            if frame != prev_frame + 1 {
                continue;
            }
            let step: Vector2<f32> = curr - prev;
            velocities.push(step.norm());
        }

        let total_distance = velocities.iter().sum::<f32>();
        let average_velocity = if velocities.is_empty() {
            0.0
        } else {
            total_distance / velocities.len() as f32
        };
        let max_velocity = velocities.iter().cloned().fold(0.0f32, f32::max);

        let center_of_mass = if positions.is_empty() {
            None
        } else {
            let n = positions.len() as f32;
            let sx = positions.iter().map(|(_, p)| p.x).sum::<f32>();
            let sy = positions.iter().map(|(_, p)| p.y).sum::<f32>();
            Some([sx / n, sy / n])
        };

        Self {
            total_distance,
            average_velocity,
            max_velocity,
            center_of_mass,
            frames_analyzed: records.len(),
        }
    }
}

/// Center-vs-periphery occupancy for a circular open-field arena. The
/// center zone is the inner half of the arena radius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenFieldSummary {
    pub center_frames: usize,
    pub periphery_frames: usize,
    pub center_percentage: f64,
    pub periphery_percentage: f64,
    pub total_frames: usize,
}

impl OpenFieldSummary {
    pub fn from_records(
        records: &[FrameRecord],
        arena_center: Point2<f32>,
        arena_radius: f32,
    ) -> Self {
        let mut center_frames = 0;
        let mut periphery_frames = 0;

        for record in records {
            let Some([x, y]) = record.position else {
                continue;
            };
            let distance = (Point2::new(x, y) - arena_center).norm();
            if distance < arena_radius * 0.5 {
                center_frames += 1;
            } else {
                periphery_frames += 1;
            }
        }

        let total = center_frames + periphery_frames;
        let (center_percentage, periphery_percentage) = if total > 0 {
            (
                center_frames as f64 / total as f64 * 100.0,
                periphery_frames as f64 / total as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        Self {
            center_frames,
            periphery_frames,
            center_percentage,
            periphery_percentage,
            total_frames: total,
        }
    }
}

/// Frames spent in each ROI, keyed by ROI name.
pub fn roi_occupancy(records: &[FrameRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        if let Some(name) = &record.roi {
            *counts.entry(name.clone()).or_insert(0) += 1;
        }
    }
    counts
}
