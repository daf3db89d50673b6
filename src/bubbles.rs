use opencv::core::{Mat, Point, Rect, Size, Vector};
use opencv::imgproc::{
    self, ADAPTIVE_THRESH_GAUSSIAN_C, CHAIN_APPROX_SIMPLE, MORPH_ELLIPSE, MORPH_OPEN,
    RETR_EXTERNAL, THRESH_BINARY_INV,
};
use opencv::prelude::*;
use serde::Serialize;

use crate::config::{BubbleFilter, DetectorConfig, PreprocessConfig};
use crate::errors::SheetError;

/// A mark-shaped contour, in coordinates of the region it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BubbleCandidate {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub center: (i32, i32),
    pub area: f64,
    pub aspect: f64,
}

impl BubbleCandidate {
    pub fn bbox(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Candidates of one region together with the binary raster they came from; the
/// fill classifier scores against the same raster.
#[derive(Debug)]
pub struct BubbleDetection {
    pub candidates: Vec<BubbleCandidate>,
    pub binary: Mat,
}

impl BubbleDetection {
    /// Top-to-bottom, then left-to-right.
    pub fn row_major(&self) -> Vec<BubbleCandidate> {
        let mut sorted = self.candidates.clone();
        sorted.sort_by_key(|c| (c.center.1, c.center.0));
        sorted
    }

    /// Left-to-right, then top-to-bottom.
    pub fn column_major(&self) -> Vec<BubbleCandidate> {
        let mut sorted = self.candidates.clone();
        sorted.sort_by_key(|c| (c.center.0, c.center.1));
        sorted
    }

    pub fn mean_width(&self) -> f64 {
        if self.candidates.is_empty() {
            return 0.0;
        }
        self.candidates.iter().map(|c| c.width as f64).sum::<f64>() / self.candidates.len() as f64
    }
}

fn odd(n: i32) -> i32 {
    if n % 2 == 0 {
        n + 1
    } else {
        n
    }
}

/// blur -> adaptive inverted threshold -> optional opening. Ink ends up white.
pub fn binarize(gray: &Mat, config: &PreprocessConfig) -> Result<Mat, SheetError> {
    let blurred = {
        let mut mat_blur = Mat::default();
        let k = odd(config.blur_kernel.max(1));
        imgproc::gaussian_blur_def(gray, &mut mat_blur, Size::new(k, k), 0.0)?;
        mat_blur
    };
    let thresholded = {
        let mut mat_thresh = Mat::default();
        imgproc::adaptive_threshold(
            &blurred,
            &mut mat_thresh,
            255.0,
            ADAPTIVE_THRESH_GAUSSIAN_C,
            THRESH_BINARY_INV,
            odd(config.block_size.max(3)),
            config.c,
        )?;
        mat_thresh
    };
    if config.open_kernel <= 0 {
        return Ok(thresholded);
    }
    // drop thin borders and speckle
    let kernel = imgproc::get_structuring_element(
        MORPH_ELLIPSE,
        Size::new(config.open_kernel, config.open_kernel),
        Point::new(-1, -1),
    )?;
    let mut opened = Mat::default();
    imgproc::morphology_ex_def(&thresholded, &mut opened, MORPH_OPEN, &kernel)?;
    Ok(opened)
}

/// Size band in pixels for a region `region_width` wide.
pub fn size_band(filter: &BubbleFilter, region_width: i32) -> (i32, i32) {
    let min = filter
        .min_size_px
        .max((region_width as f64 * filter.min_size_frac) as i32);
    let max = filter
        .max_size_px
        .max((region_width as f64 * filter.max_size_frac) as i32);
    (min, max)
}

pub fn accepts(filter: &BubbleFilter, band: (i32, i32), bbox: Rect, area: f64) -> bool {
    let (min, max) = band;
    if bbox.height == 0 {
        return false;
    }
    let aspect = bbox.width as f64 / bbox.height as f64;
    (min..=max).contains(&bbox.width)
        && (min..=max).contains(&bbox.height)
        && aspect >= filter.min_aspect
        && aspect <= filter.max_aspect
        && area > filter.min_area
}

/// Extracts bubble-shaped contours from a grayscale region.
///
/// Fails with `NoBubblesDetected` when fewer than `min_candidates` survive the
/// shape filter.
pub fn detect_bubbles(
    region: &Mat,
    config: &DetectorConfig,
    min_candidates: usize,
) -> Result<BubbleDetection, SheetError> {
    let binary = binarize(region, &config.preprocess)?;

    let contours: Vector<Vector<Point>> = {
        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours_def(&binary, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)?;
        contours
    };

    let band = size_band(&config.filter, region.cols());
    let mut candidates = Vec::new();
    for contour in contours.iter() {
        let bbox = imgproc::bounding_rect(&contour)?;
        let area = imgproc::contour_area_def(&contour)?;
        if !accepts(&config.filter, band, bbox, area) {
            continue;
        }
        candidates.push(BubbleCandidate {
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
            center: (bbox.x + bbox.width / 2, bbox.y + bbox.height / 2),
            area,
            aspect: bbox.width as f64 / bbox.height as f64,
        });
    }
    log::debug!(
        "{} of {} contours kept as bubbles (size band {}..={})",
        candidates.len(),
        contours.len(),
        band.0,
        band.1
    );

    if candidates.len() < min_candidates {
        return Err(SheetError::NoBubblesDetected {
            found: candidates.len(),
            needed: min_candidates,
        });
    }
    Ok(BubbleDetection { candidates, binary })
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};
    use opencv::imgproc::{FILLED, LINE_8};

    fn blank(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(255.0)).unwrap()
    }

    fn ring(mat: &mut Mat, cx: i32, cy: i32, r: i32) {
        imgproc::circle(mat, Point::new(cx, cy), r, Scalar::all(0.0), 3, LINE_8, 0).unwrap();
    }

    fn disc(mat: &mut Mat, cx: i32, cy: i32, r: i32) {
        imgproc::circle(mat, Point::new(cx, cy), r, Scalar::all(0.0), FILLED, LINE_8, 0).unwrap();
    }

    #[test]
    fn test_size_band_uses_fraction_and_floor() {
        let filter = BubbleFilter::default();
        assert_eq!(size_band(&filter, 1000), (12, 45));
        assert_eq!(size_band(&filter, 100), (6, 20));
    }

    #[test]
    fn test_filter_rejects_elongated_and_tiny() {
        let filter = BubbleFilter::default();
        let band = (12, 45);
        assert!(accepts(&filter, band, Rect::new(0, 0, 20, 20), 300.0));
        assert!(!accepts(&filter, band, Rect::new(0, 0, 40, 20), 600.0));
        assert!(!accepts(&filter, band, Rect::new(0, 0, 8, 8), 50.0));
        assert!(!accepts(&filter, band, Rect::new(0, 0, 60, 60), 3000.0));
        assert!(!accepts(&filter, band, Rect::new(0, 0, 20, 20), 10.0));
    }

    #[test]
    fn test_detects_row_of_bubbles() {
        let mut mat = blank(100, 1000);
        for i in 0..5 {
            let cx = 100 + i * 60;
            if i == 2 {
                disc(&mut mat, cx, 50, 10);
            } else {
                ring(&mut mat, cx, 50, 10);
            }
        }
        let detection = detect_bubbles(&mat, &DetectorConfig::default(), 5).unwrap();
        assert_eq!(detection.candidates.len(), 5);
        let xs: Vec<i32> = detection.row_major().iter().map(|c| c.center.0).collect();
        for (i, x) in xs.iter().enumerate() {
            assert!((x - (100 + i as i32 * 60)).abs() <= 2, "{xs:?}");
        }
        assert!(detection.mean_width() > 15.0);
    }

    #[test]
    fn test_ignores_lines_and_specks() {
        let mut mat = blank(200, 1000);
        imgproc::line(
            &mut mat,
            Point::new(10, 100),
            Point::new(990, 100),
            Scalar::all(0.0),
            2,
            LINE_8,
            0,
        )
        .unwrap();
        disc(&mut mat, 500, 40, 1);
        let result = detect_bubbles(&mat, &DetectorConfig::default(), 5);
        assert!(matches!(
            result,
            Err(SheetError::NoBubblesDetected { found: 0, needed: 5 })
        ));
    }

    #[test]
    fn test_column_major_order() {
        let mut mat = blank(300, 1000);
        for (cx, cy) in [(300, 50), (100, 250), (100, 50), (300, 250)] {
            ring(&mut mat, cx, cy, 10);
        }
        let detection = detect_bubbles(&mat, &DetectorConfig::default(), 4).unwrap();
        let order: Vec<(i32, i32)> = detection
            .column_major()
            .iter()
            .map(|c| ((c.center.0 + 50) / 100 * 100, (c.center.1 + 50) / 100 * 100))
            .collect();
        assert_eq!(order, vec![(100, 100), (100, 300), (300, 100), (300, 300)]);
    }
}
