use anyhow::Result;
use nalgebra::Point2;
use opencv::{
    core::{self, Mat, Point, Size},
    imgproc,
    prelude::*,
};

use crate::background::BackgroundModel;
use crate::utils;

pub const DEFAULT_DIFF_THRESHOLD: i32 = 25;

const MORPH_KERNEL_SIZE: i32 = 3;
const MORPH_ITERATIONS: i32 = 2;

/// Locate the animal by background subtraction: absolute difference against
/// the reference frame, thresholding, morphological cleanup, then the
/// centroid of the largest foreground region. Returns `None` when no
/// foreground region survives.
pub fn detect(
    frame: &Mat,
    background: &BackgroundModel,
    roi_mask: Option<&Mat>,
    threshold: i32,
) -> Result<Option<Point2<f32>>> {
    let gray = if frame.channels() == 1 {
        frame.try_clone()?
    } else {
        let mut gray = Mat::default();
        imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
        gray
    };

    // Pixels outside the ROI mask contribute nothing to the difference.
    let (gray, reference) = match roi_mask {
        Some(mask) => {
            let mut masked_frame = Mat::default();
            core::bitwise_and(&gray, &gray, &mut masked_frame, mask)?;
            let mut masked_bg = Mat::default();
            core::bitwise_and(
                background.frame(),
                background.frame(),
                &mut masked_bg,
                mask,
            )?;
            (masked_frame, masked_bg)
        }
        None => (gray, background.frame().try_clone()?),
    };

    let mut diff = Mat::default();
    core::absdiff(&gray, &reference, &mut diff)?;

    let mut binary = Mat::default();
    imgproc::threshold(
        &diff,
        &mut binary,
        threshold as f64,
        255.0,
        imgproc::THRESH_BINARY,
    )?;

    let kernel = imgproc::get_structuring_element(
        imgproc::MORPH_RECT,
        Size::new(MORPH_KERNEL_SIZE, MORPH_KERNEL_SIZE),
        Point::new(-1, -1),
    )?;

    // Opening removes speckle noise, closing fills small gaps; the order is
    // part of the detection contract.
    let mut opened = Mat::default();
    imgproc::morphology_ex(
        &binary,
        &mut opened,
        imgproc::MORPH_OPEN,
        &kernel,
        Point::new(-1, -1),
        MORPH_ITERATIONS,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;

    let mut closed = Mat::default();
    imgproc::morphology_ex(
        &opened,
        &mut closed,
        imgproc::MORPH_CLOSE,
        &kernel,
        Point::new(-1, -1),
        MORPH_ITERATIONS,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;

    let contour = match utils::largest_contour(&closed)? {
        Some(contour) => contour,
        None => return Ok(None),
    };

    let mask = utils::mask_from_contour(&contour, closed.rows(), closed.cols())?;
    utils::centroid_of_mask(&mask)
}
