use anyhow::Result;
use nalgebra::Point2;
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size},
    imgproc,
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Shape of a region of interest. Coordinates are in frame pixels; the
/// shared center lives on [`Roi`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "roi_type")]
pub enum RoiShape {
    Rectangle { width: f32, height: f32 },
    Circle { radius: f32 },
    Polygon { vertices: Vec<[f32; 2]> },
}

/// A named region of the arena against which positions are tested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roi {
    pub name: String,
    pub center_x: f32,
    pub center_y: f32,
    #[serde(flatten)]
    pub shape: RoiShape,
}

impl Roi {
    /// Containment test, inclusive of the shape boundary.
    pub fn contains(&self, point: Point2<f32>) -> bool {
        match &self.shape {
            RoiShape::Rectangle { width, height } => {
                let hw = width / 2.0;
                let hh = height / 2.0;
                point.x >= self.center_x - hw
                    && point.x <= self.center_x + hw
                    && point.y >= self.center_y - hh
                    && point.y <= self.center_y + hh
            }
            RoiShape::Circle { radius } => {
                let dx = point.x - self.center_x;
                let dy = point.y - self.center_y;
                (dx * dx + dy * dy).sqrt() <= *radius
            }
            RoiShape::Polygon { vertices } => polygon_contains(vertices, point),
        }
    }
}

/// Ray-casting point-in-polygon test; points on an edge count as inside.
fn polygon_contains(vertices: &[[f32; 2]], p: Point2<f32>) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }

    for i in 0..n {
        if on_segment(vertices[i], vertices[(i + 1) % n], p) {
            return true;
        }
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (vertices[i][0], vertices[i][1]);
        let (xj, yj) = (vertices[j][0], vertices[j][1]);
        if (yi > p.y) != (yj > p.y) {
            let x_cross = xi + (p.y - yi) * (xj - xi) / (yj - yi);
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: [f32; 2], b: [f32; 2], p: Point2<f32>) -> bool {
    let (abx, aby) = (b[0] - a[0], b[1] - a[1]);
    let (apx, apy) = (p.x - a[0], p.y - a[1]);
    let cross = abx * apy - aby * apx;
    if cross.abs() > 1e-4 {
        return false;
    }
    let dot = apx * abx + apy * aby;
    let len2 = abx * abx + aby * aby;
    dot >= 0.0 && dot <= len2
}

/// Ordered collection of ROIs. Insertion order carries priority: when regions
/// overlap, the most recently added ROI wins resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoiCollection {
    rois: Vec<Roi>,
}

impl RoiCollection {
    pub fn new() -> Self {
        Self { rois: Vec::new() }
    }

    pub fn from_rois(rois: Vec<Roi>) -> Self {
        Self { rois }
    }

    pub fn push(&mut self, roi: Roi) {
        self.rois.push(roi);
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Roi> {
        self.rois.iter()
    }

    pub fn clear(&mut self) {
        self.rois.clear();
    }

    /// Remove the ROI with the given name, if present.
    pub fn remove(&mut self, name: &str) -> Option<Roi> {
        let idx = self.rois.iter().position(|r| r.name == name)?;
        Some(self.rois.remove(idx))
    }

    /// Find the ROI containing `point`, scanning in reverse insertion order
    /// so the last-added region wins when shapes overlap.
    pub fn resolve(&self, point: Point2<f32>) -> Option<(usize, &Roi)> {
        self.rois
            .iter()
            .enumerate()
            .rev()
            .find(|(_, roi)| roi.contains(point))
    }

    /// Rasterize all ROIs into a single binary mask (255 inside any region).
    /// Returns `None` for an empty collection.
    pub fn rasterize(&self, width: i32, height: i32) -> Result<Option<Mat>> {
        if self.rois.is_empty() {
            return Ok(None);
        }

        let mut mask =
            Mat::new_size_with_default(Size::new(width, height), core::CV_8UC1, Scalar::all(0.0))?;

        for roi in &self.rois {
            match &roi.shape {
                RoiShape::Rectangle { width: w, height: h } => {
                    let x1 = (roi.center_x - w / 2.0) as i32;
                    let y1 = (roi.center_y - h / 2.0) as i32;
                    let rect = Rect::new(x1, y1, *w as i32, *h as i32);
                    imgproc::rectangle(&mut mask, rect, Scalar::all(255.0), -1, imgproc::LINE_8, 0)?;
                }
                RoiShape::Circle { radius } => {
                    let center = Point::new(roi.center_x as i32, roi.center_y as i32);
                    imgproc::circle(
                        &mut mask,
                        center,
                        *radius as i32,
                        Scalar::all(255.0),
                        -1,
                        imgproc::LINE_8,
                        0,
                    )?;
                }
                RoiShape::Polygon { vertices } => {
                    let mut points = core::Vector::<Point>::new();
                    for v in vertices {
                        points.push(Point::new(v[0] as i32, v[1] as i32));
                    }
                    let mut polys = core::Vector::<core::Vector<Point>>::new();
                    polys.push(points);
                    imgproc::fill_poly(
                        &mut mask,
                        &polys,
                        Scalar::all(255.0),
                        imgproc::LINE_8,
                        0,
                        Point::new(0, 0),
                    )?;
                }
            }
        }

        Ok(Some(mask))
    }
}

/// A saved set of ROIs, tied to the frame dimensions it was drawn against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiPreset {
    pub preset_name: String,
    #[serde(default)]
    pub description: String,
    pub frame_width: i32,
    pub frame_height: i32,
    pub rois: Vec<Roi>,
}

impl RoiPreset {
    /// Load from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let preset: RoiPreset = serde_json::from_str(&data)?;
        Ok(preset)
    }

    /// Save as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn into_collection(self) -> RoiCollection {
        RoiCollection::from_rois(self.rois)
    }
}
