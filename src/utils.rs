use anyhow::Result;
use nalgebra::Point2;
use opencv::{
    core::{self, Mat, Point, Scalar},
    imgproc,
    prelude::*,
};

/// Image-moment centroid of a binary mask (m10/m00, m01/m00).
/// Returns `None` for a mask with zero area.
pub fn centroid_of_mask(mask: &Mat) -> Result<Option<Point2<f32>>> {
    let m = imgproc::moments(mask, true)?;
    if m.m00 <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Point2::new(
        (m.m10 / m.m00) as f32,
        (m.m01 / m.m00) as f32,
    )))
}

/// Largest external contour of a binary image by area. Exactly-equal areas
/// keep the first contour encountered in OpenCV's enumeration order.
pub fn largest_contour(binary: &Mat) -> Result<Option<core::Vector<Point>>> {
    let mut contours = core::Vector::<core::Vector<Point>>::new();
    imgproc::find_contours(
        binary,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut best: Option<(f64, core::Vector<Point>)> = None;
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        match &best {
            Some((best_area, _)) if area <= *best_area => {}
            _ => best = Some((area, contour)),
        }
    }

    Ok(best.map(|(_, contour)| contour))
}

/// Rasterize a single contour as a filled binary mask with the given
/// dimensions.
pub fn mask_from_contour(contour: &core::Vector<Point>, rows: i32, cols: i32) -> Result<Mat> {
    let mut mask = Mat::zeros(rows, cols, core::CV_8UC1)?.to_mat()?;
    let mut contours = core::Vector::<core::Vector<Point>>::new();
    contours.push(contour.clone());
    imgproc::draw_contours(
        &mut mask,
        &contours,
        0,
        Scalar::all(255.0),
        -1,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::new(0, 0),
    )?;
    Ok(mask)
}

/// Simplify a contour to a polygon outline; tolerance is a fraction of the
/// contour perimeter.
pub fn simplify_contour(
    contour: &core::Vector<Point>,
    tolerance_frac: f64,
) -> Result<Vec<[f32; 2]>> {
    let perimeter = imgproc::arc_length(contour, true)?;
    let mut approx = core::Vector::<Point>::new();
    imgproc::approx_poly_dp(contour, &mut approx, tolerance_frac * perimeter, true)?;
    Ok(approx.iter().map(|p| [p.x as f32, p.y as f32]).collect())
}

/// IoU between two corner-form boxes [x1, y1, x2, y2].
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;

    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Non-max suppression over corner-form boxes; returns indices to keep.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    idxs.sort_unstable_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut keep = Vec::new();
    while let Some(&i) = idxs.first() {
        keep.push(i);
        idxs = idxs
            .into_iter()
            .skip(1)
            .filter(|&j| box_iou(&boxes[i], &boxes[j]) < iou_thresh)
            .collect();
    }
    keep
}
