use opencv::core::{self, Mat, Point, Rect, Scalar, CV_8UC1};
use opencv::imgproc::{self, FILLED, LINE_8};
use opencv::prelude::*;
use serde::Serialize;

use crate::config::FillConfig;
use crate::errors::SheetError;

/// Fraction of foreground pixels inside a circular mask, in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Default)]
pub struct FillScore(pub f64);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum RowDecision {
    Marked { column: usize, score: FillScore },
    Unmarked { best: FillScore },
}

impl RowDecision {
    pub fn column(&self) -> Option<usize> {
        match self {
            RowDecision::Marked { column, .. } => Some(*column),
            RowDecision::Unmarked { .. } => None,
        }
    }
}

/// Mask radius for bubbles whose mean width is `mean_width`.
pub fn mask_radius(mean_width: f64, factor: f64, min_radius: i32) -> i32 {
    ((mean_width * factor) as i32).max(min_radius)
}

/// Scores the circle at `center` against a binary raster where ink is non-zero.
///
/// Only the part of the circle inside the raster counts, so cells on the edge are
/// scored against what is visible of them.
pub fn fill_score(binary: &Mat, center: (i32, i32), radius: i32) -> Result<FillScore, SheetError> {
    let bounds = Rect::new(0, 0, binary.cols(), binary.rows());
    let window = Rect::new(
        center.0 - radius,
        center.1 - radius,
        2 * radius + 1,
        2 * radius + 1,
    ) & bounds;
    if window.width <= 0 || window.height <= 0 {
        return Ok(FillScore(0.0));
    }

    let roi = Mat::roi(binary, window)?.try_clone()?;
    let mut mask =
        Mat::new_rows_cols_with_default(window.height, window.width, CV_8UC1, Scalar::all(0.0))?;
    imgproc::circle(
        &mut mask,
        Point::new(center.0 - window.x, center.1 - window.y),
        radius,
        Scalar::all(255.0),
        FILLED,
        LINE_8,
        0,
    )?;

    let mask_pixels = core::count_non_zero(&mask)?;
    if mask_pixels == 0 {
        return Ok(FillScore(0.0));
    }
    let mut inked = Mat::default();
    core::bitwise_and(&roi, &roi, &mut inked, &mask)?;
    let filled = core::count_non_zero(&inked)?;
    Ok(FillScore(filled as f64 / mask_pixels as f64))
}

/// Highest score of a row, first one on ties.
pub fn best_cell(scores: &[FillScore]) -> Option<(usize, FillScore)> {
    let mut best: Option<(usize, FillScore)> = None;
    for (column, &score) in scores.iter().enumerate() {
        match best {
            Some((_, top)) if score.0 <= top.0 => {}
            _ => best = Some((column, score)),
        }
    }
    best
}

/// Picks the best cell of a row. Ties go to the lowest column; the winner only
/// counts as marked above `threshold`.
pub fn classify_row(scores: &[FillScore], threshold: f64) -> RowDecision {
    match best_cell(scores) {
        Some((column, score)) if score.0 > threshold => RowDecision::Marked { column, score },
        Some((_, score)) => RowDecision::Unmarked { best: score },
        None => RowDecision::Unmarked {
            best: FillScore(0.0),
        },
    }
}

/// Scores every center of a row and classifies it.
pub fn score_row(
    binary: &Mat,
    centers: &[(i32, i32)],
    radius: i32,
    config: &FillConfig,
) -> Result<(Vec<FillScore>, RowDecision), SheetError> {
    let scores = centers
        .iter()
        .map(|&center| fill_score(binary, center, radius))
        .collect::<Result<Vec<_>, _>>()?;
    let decision = classify_row(&scores, config.threshold);
    Ok((scores, decision))
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn black(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(0.0)).unwrap()
    }

    /// Inks the top `rows` pixel rows of the bubble at (50, 50) radius 10.
    fn partially_inked(rows: i32) -> Mat {
        let mut mat = black(100, 100);
        if rows > 0 {
            imgproc::rectangle(
                &mut mat,
                Rect::new(40, 40, 21, rows),
                Scalar::all(255.0),
                FILLED,
                LINE_8,
                0,
            )
            .unwrap();
        }
        mat
    }

    #[test]
    fn test_score_is_monotone_in_coverage() {
        let config = FillConfig::default();
        let mut previous = -1.0;
        for rows in [0, 3, 6, 10, 14, 18, 21] {
            let score = fill_score(&partially_inked(rows), (50, 50), 10).unwrap().0;
            assert!(score >= previous, "{rows} rows scored {score} after {previous}");
            previous = score;
        }
        let empty = fill_score(&partially_inked(0), (50, 50), 10).unwrap().0;
        let full = fill_score(&partially_inked(21), (50, 50), 10).unwrap().0;
        assert_eq!(empty, 0.0);
        assert_eq!(full, 1.0);
        assert!(empty < config.threshold);
        assert!(full > config.threshold);
    }

    #[test]
    fn test_cell_on_the_edge_counts_visible_part() {
        let mut mat = black(40, 40);
        imgproc::rectangle(&mut mat, Rect::new(0, 0, 40, 40), Scalar::all(255.0), FILLED, LINE_8, 0)
            .unwrap();
        let score = fill_score(&mat, (0, 0), 8).unwrap();
        assert_eq!(score.0, 1.0);
        let outside = fill_score(&mat, (100, 100), 8).unwrap();
        assert_eq!(outside.0, 0.0);
    }

    #[test]
    fn test_row_winner_and_threshold() {
        let scores = [0.05, 0.8, 0.1, 0.3, 0.0].map(FillScore);
        assert_eq!(classify_row(&scores, 0.2).column(), Some(1));

        let faint = [0.05, 0.15, 0.1, 0.0, 0.19].map(FillScore);
        assert!(matches!(
            classify_row(&faint, 0.2),
            RowDecision::Unmarked { best: FillScore(b) } if b == 0.19
        ));
    }

    #[test]
    fn test_ties_go_to_lowest_column() {
        let scores = [0.1, 0.7, 0.7, 0.7, 0.2].map(FillScore);
        assert_eq!(classify_row(&scores, 0.2).column(), Some(1));
    }

    #[test]
    fn test_empty_row_is_unmarked() {
        assert_eq!(classify_row(&[], 0.2).column(), None);
    }

    #[test]
    fn test_score_row_on_drawn_discs() {
        let mut mat = black(60, 260);
        imgproc::circle(&mut mat, Point::new(130, 30), 12, Scalar::all(255.0), FILLED, LINE_8, 0)
            .unwrap();
        let centers = [(50, 30), (90, 30), (130, 30), (170, 30), (210, 30)];
        let (scores, decision) = score_row(&mat, &centers, 8, &FillConfig::default()).unwrap();
        assert_eq!(scores.len(), 5);
        assert_eq!(decision.column(), Some(2));
        assert_eq!(scores[0].0, 0.0);
    }

    #[test]
    fn test_default_mask_stays_inside_printed_ring() {
        let config = FillConfig::default();
        // binarized ring of radius 12, about 4 px of ink
        let mut mat = black(60, 60);
        imgproc::circle(&mut mat, Point::new(30, 30), 12, Scalar::all(255.0), 4, LINE_8, 0).unwrap();
        let radius = mask_radius(29.0, config.radius_factor, config.min_radius);
        let score = fill_score(&mat, (30, 30), radius).unwrap();
        assert!(score.0 < config.threshold, "empty ring scored {}", score.0);
    }

    #[test]
    fn test_mask_radius_floor() {
        assert_eq!(mask_radius(24.0, 0.6, 8), 14);
        assert_eq!(mask_radius(10.0, 0.6, 8), 8);
    }
}
