use opencv::{
    core::{Point, Scalar},
    imgproc,
    prelude::*,
};

use crate::detection::Keypoint;
use crate::pipeline::FrameRecord;
use crate::roi::{Roi, RoiCollection, RoiShape};

const ROI_COLOR: Scalar = Scalar::new(0.0, 255.0, 0.0, 0.0); // green, BGR
const POSITION_COLOR: Scalar = Scalar::new(255.0, 0.0, 255.0, 0.0); // magenta
const TRAIL_COLOR: Scalar = Scalar::new(0.0, 255.0, 255.0, 0.0); // yellow
const SKELETON_COLOR: Scalar = Scalar::new(0.0, 255.0, 0.0, 0.0);

/// Skeleton edges of the 7-point rodent pose model, nose to tail tip.
const SKELETON: &[(&str, &str)] = &[
    ("N", "LEar"),
    ("N", "REar"),
    ("LEar", "BC"),
    ("REar", "BC"),
    ("BC", "TB"),
    ("TB", "TM"),
    ("TM", "TT"),
];

pub fn draw_roi(frame: &mut Mat, roi: &Roi) -> opencv::Result<()> {
    match &roi.shape {
        RoiShape::Rectangle { width, height } => {
            let rect = opencv::core::Rect::new(
                (roi.center_x - width / 2.0) as i32,
                (roi.center_y - height / 2.0) as i32,
                *width as i32,
                *height as i32,
            );
            imgproc::rectangle(frame, rect, ROI_COLOR, 2, imgproc::LINE_8, 0)?;
        }
        RoiShape::Circle { radius } => {
            let center = Point::new(roi.center_x as i32, roi.center_y as i32);
            imgproc::circle(frame, center, *radius as i32, ROI_COLOR, 2, imgproc::LINE_8, 0)?;
        }
        RoiShape::Polygon { vertices } => {
            let mut points = opencv::core::Vector::<Point>::new();
            for v in vertices {
                points.push(Point::new(v[0] as i32, v[1] as i32));
            }
            let mut polys = opencv::core::Vector::<opencv::core::Vector<Point>>::new();
            polys.push(points);
            imgproc::polylines(frame, &polys, true, ROI_COLOR, 2, imgproc::LINE_8, 0)?;
        }
    }

    imgproc::put_text(
        frame,
        &roi.name,
        Point::new(roi.center_x as i32, roi.center_y as i32),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        ROI_COLOR,
        1,
        imgproc::LINE_8,
        false,
    )
}

pub fn draw_rois(frame: &mut Mat, rois: &RoiCollection) -> opencv::Result<()> {
    for roi in rois.iter() {
        draw_roi(frame, roi)?;
    }
    Ok(())
}

/// Position marker: a filled dot with a white outline so it stays visible on
/// both dark and bright fur.
pub fn draw_position(frame: &mut Mat, position: [f32; 2]) -> opencv::Result<()> {
    let center = Point::new(position[0] as i32, position[1] as i32);
    imgproc::circle(frame, center, 4, POSITION_COLOR, -1, imgproc::LINE_8, 0)?;
    imgproc::circle(
        frame,
        center,
        6,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        1,
        imgproc::LINE_8,
        0,
    )
}

/// Trajectory polyline over the most recent records that carry a position.
pub fn draw_trail(frame: &mut Mat, records: &[FrameRecord], max_points: usize) -> opencv::Result<()> {
    let trail: Vec<Point> = records
        .iter()
        .rev()
        .filter_map(|r| r.position)
        .take(max_points)
        .map(|p| Point::new(p[0] as i32, p[1] as i32))
        .collect();

    for pair in trail.windows(2) {
        imgproc::line(frame, pair[0], pair[1], TRAIL_COLOR, 1, imgproc::LINE_8, 0)?;
    }
    Ok(())
}

pub fn draw_keypoints(frame: &mut Mat, keypoints: &[Keypoint]) -> opencv::Result<()> {
    for kp in keypoints {
        let center = Point::new(kp.x as i32, kp.y as i32);
        imgproc::circle(frame, center, 3, POSITION_COLOR, -1, imgproc::LINE_8, 0)?;
        imgproc::circle(
            frame,
            center,
            4,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            1,
            imgproc::LINE_8,
            0,
        )?;
    }

    for (a, b) in SKELETON {
        let pa = keypoints.iter().find(|kp| kp.name == *a);
        let pb = keypoints.iter().find(|kp| kp.name == *b);
        if let (Some(pa), Some(pb)) = (pa, pb) {
            imgproc::line(
                frame,
                Point::new(pa.x as i32, pa.y as i32),
                Point::new(pb.x as i32, pb.y as i32),
                SKELETON_COLOR,
                1,
                imgproc::LINE_8,
                0,
            )?;
        }
    }
    Ok(())
}

pub fn draw_frame_info(frame: &mut Mat, frame_number: usize, method: &str) -> opencv::Result<()> {
    let text = format!("Frame: {} Method: {}", frame_number, method);
    imgproc::put_text(
        frame,
        &text,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.6,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )
}
