//! Turns located anchors into absolute pixel regions.
//!
//! Four markers rectify the sheet into a canonical frame; a single text anchor
//! places template regions at offsets scaled by the image/template size ratio.

use opencv::core::{Mat, Point2f, Rect, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Serialize;

use crate::anchor::{AnchorPoint, AnchorSet};
use crate::config::{PerspectiveConfig, RegionKind, Template, TemplateConfig};
use crate::errors::SheetError;
use crate::image::RasterImage;

/// Mapping from template-relative offsets to image pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CalibrationFrame {
    /// Source image to canonical frame.
    Homography {
        matrix: [[f64; 3]; 3],
        width: i32,
        height: i32,
    },
    Scaled {
        fx: f64,
        fy: f64,
        anchor: (f64, f64),
    },
}

/// An absolute region of the working image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    pub rect: Rect,
    pub kind: RegionKind,
}

#[derive(Debug)]
pub struct ResolvedRegions {
    /// The raster the blocks refer to: rectified in perspective mode, the input
    /// otherwise.
    pub image: RasterImage,
    pub frame: CalibrationFrame,
    pub blocks: Vec<Block>,
}

pub fn resolve_regions(
    image: &RasterImage,
    anchors: &AnchorSet,
    perspective: &PerspectiveConfig,
    templates: &TemplateConfig,
) -> Result<ResolvedRegions, SheetError> {
    match anchors {
        AnchorSet::Markers(points) => {
            let centers: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
            let corners = order_corners(&centers)
                .filter(|corners| quad_shape(corners).is_some())
                .ok_or(SheetError::InsufficientMarkers {
                    found: points.len(),
                })?;
            let (rectified, frame) = rectify(image, &corners, perspective)?;
            let blocks = place_template(
                &templates.canonical,
                (0.0, 0.0),
                rectified.width(),
                rectified.height(),
            );
            if !blocks.iter().any(|b| b.kind == RegionKind::Identifier) {
                log::debug!("canonical template has no identifier region");
            }
            Ok(ResolvedRegions {
                image: rectified,
                frame,
                blocks,
            })
        }
        AnchorSet::Text(AnchorPoint { x, y, .. }) => {
            let (fx, fy) = scale_factors(&templates.anchored, image.width(), image.height());
            let blocks = place_template(&templates.anchored, (*x, *y), image.width(), image.height());
            Ok(ResolvedRegions {
                image: image.try_clone()?,
                frame: CalibrationFrame::Scaled {
                    fx,
                    fy,
                    anchor: (*x, *y),
                },
                blocks,
            })
        }
    }
}

/// Picks the outermost four points as `[top_left, top_right, bottom_right,
/// bottom_left]`: extremes of `x + y` for the main diagonal and of `y - x` for the
/// other one.
pub fn order_corners(points: &[(f64, f64)]) -> Option<[(f64, f64); 4]> {
    if points.len() < 4 {
        return None;
    }
    let sum = |p: &(f64, f64)| p.0 + p.1;
    let diff = |p: &(f64, f64)| p.1 - p.0;
    Some([
        extreme(points, sum, false),
        extreme(points, diff, false),
        extreme(points, sum, true),
        extreme(points, diff, true),
    ])
}

/// Area and sharpest corner of an ordered quadrilateral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadShape {
    pub area: f64,
    /// Smallest `|sin|` of the four interior angles.
    pub min_sine: f64,
}

/// Shape of `[top_left, top_right, bottom_right, bottom_left]`, or `None` for a
/// degenerate or non-convex outline.
pub fn quad_shape(corners: &[(f64, f64); 4]) -> Option<QuadShape> {
    let mut min_sine = f64::INFINITY;
    let mut turn = 0.0f64;
    for i in 0..4 {
        let p = corners[i];
        let prev = corners[(i + 3) % 4];
        let next = corners[(i + 1) % 4];
        let a = (prev.0 - p.0, prev.1 - p.1);
        let b = (next.0 - p.0, next.1 - p.1);
        let norms = a.0.hypot(a.1) * b.0.hypot(b.1);
        if norms < 1e-9 {
            return None;
        }
        let cross = a.0 * b.1 - a.1 * b.0;
        if cross.abs() < 1e-9 || turn * cross < 0.0 {
            return None;
        }
        turn = cross;
        min_sine = min_sine.min(cross.abs() / norms);
    }
    let area = (0..4)
        .map(|i| {
            let (x0, y0) = corners[i];
            let (x1, y1) = corners[(i + 1) % 4];
            x0 * y1 - x1 * y0
        })
        .sum::<f64>()
        .abs()
        / 2.0;
    Some(QuadShape { area, min_sine })
}

fn extreme(points: &[(f64, f64)], key: impl Fn(&(f64, f64)) -> f64, want_max: bool) -> (f64, f64) {
    let mut best = points[0];
    for p in &points[1..] {
        let better = if want_max {
            key(p) > key(&best)
        } else {
            key(p) < key(&best)
        };
        if better {
            best = *p;
        }
    }
    best
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Canonical frame size: the longer of each pair of opposite edges, widened by the
/// margin and floored at the configured minimum.
pub fn canonical_size(corners: &[(f64, f64); 4], config: &PerspectiveConfig) -> (i32, i32) {
    let [tl, tr, br, bl] = *corners;
    let width = distance(br, bl).max(distance(tr, tl));
    let height = distance(tr, br).max(distance(tl, bl));
    let width = ((width * config.margin) as i32).max(config.min_width);
    let height = ((height * config.margin) as i32).max(config.min_height);
    (width, height)
}

pub fn rectify(
    image: &RasterImage,
    corners: &[(f64, f64); 4],
    config: &PerspectiveConfig,
) -> Result<(RasterImage, CalibrationFrame), SheetError> {
    let (width, height) = canonical_size(corners, config);
    let w = (width - 1) as f32;
    let h = (height - 1) as f32;

    let src: Vector<Point2f> = corners
        .iter()
        .map(|&(x, y)| Point2f::new(x as f32, y as f32))
        .collect();
    let dst: Vector<Point2f> = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
        .into_iter()
        .map(|(x, y)| Point2f::new(x, y))
        .collect();

    let transform = imgproc::get_perspective_transform_def(&src, &dst)?;
    let mut matrix = [[0.0f64; 3]; 3];
    for (r, row) in matrix.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = *transform.at_2d::<f64>(r as i32, c as i32)?;
        }
    }

    let mut warped = Mat::default();
    imgproc::warp_perspective_def(image.mat(), &mut warped, &transform, Size::new(width, height))?;
    log::debug!("rectified sheet into {width}x{height} canonical frame");

    let rectified = RasterImage::from_mat(warped)?;
    Ok((
        rectified,
        CalibrationFrame::Homography {
            matrix,
            width,
            height,
        },
    ))
}

/// Applies a 3x3 homography to a point.
pub fn project(matrix: &[[f64; 3]; 3], x: f64, y: f64) -> (f64, f64) {
    let u = matrix[0][0] * x + matrix[0][1] * y + matrix[0][2];
    let v = matrix[1][0] * x + matrix[1][1] * y + matrix[1][2];
    let w = matrix[2][0] * x + matrix[2][1] * y + matrix[2][2];
    if w.abs() < 1e-12 {
        return (f64::NAN, f64::NAN);
    }
    (u / w, v / w)
}

pub fn scale_factors(template: &Template, image_width: i32, image_height: i32) -> (f64, f64) {
    (
        image_width as f64 / template.reference_width,
        image_height as f64 / template.reference_height,
    )
}

/// Places every template region at `anchor + offset * (fx, fy)`, clamped to the
/// image. Regions that fall entirely outside are dropped.
pub fn place_template(
    template: &Template,
    anchor: (f64, f64),
    image_width: i32,
    image_height: i32,
) -> Vec<Block> {
    let (fx, fy) = scale_factors(template, image_width, image_height);
    template
        .regions
        .iter()
        .filter_map(|region| {
            let x0 = (anchor.0 + region.x * fx).round() as i32;
            let y0 = (anchor.1 + region.y * fy).round() as i32;
            let x1 = x0 + (region.width * fx).round() as i32;
            let y1 = y0 + (region.height * fy).round() as i32;
            let rect = clamp_rect(x0, y0, x1, y1, image_width, image_height);
            if rect.is_none() {
                log::warn!("{:?} region falls outside the image", region.kind);
            }
            rect.map(|rect| Block {
                rect,
                kind: region.kind,
            })
        })
        .collect()
}

fn clamp_rect(x0: i32, y0: i32, x1: i32, y1: i32, width: i32, height: i32) -> Option<Rect> {
    let (cx0, cy0) = (x0.max(0), y0.max(0));
    let (cx1, cy1) = (x1.min(width), y1.min(height));
    if (cx0, cy0, cx1, cy1) != (x0, y0, x1, y1) {
        log::debug!("region clamped from ({x0},{y0})-({x1},{y1}) to ({cx0},{cy0})-({cx1},{cy1})");
    }
    if cx1 <= cx0 || cy1 <= cy0 {
        return None;
    }
    Some(Rect::new(cx0, cy0, cx1 - cx0, cy1 - cy0))
}
