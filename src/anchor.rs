use opencv::core::{Point, Rect, Size, Vector};
use opencv::imgproc::{
    self, CHAIN_APPROX_SIMPLE, MORPH_CLOSE, MORPH_RECT, RETR_EXTERNAL, THRESH_BINARY_INV,
    THRESH_OTSU,
};
use opencv::prelude::*;
use serde::Serialize;

use crate::config::{MarkerConfig, TextAnchorConfig};
use crate::err_log;
use crate::errors::SheetError;
use crate::image::RasterImage;
use crate::ocr::{normalize_token, RecognizedWord, TextRecognizer};
use crate::region::{order_corners, quad_shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorSource {
    TextKeyword,
    TextFallback,
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnchorPoint {
    pub x: f64,
    pub y: f64,
    pub confidence: f32,
    pub source: AnchorSource,
}

/// What one successful strategy produced for a sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "points")]
pub enum AnchorSet {
    /// A single landmark; regions hang off it at scaled offsets.
    Text(AnchorPoint),
    /// Four or more square markers; the outermost four drive rectification.
    Markers(Vec<AnchorPoint>),
}

/// A square marker found on the sheet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub bbox: Rect,
    pub center: (f64, f64),
    pub area: f64,
}

pub trait AnchorStrategy {
    fn name(&self) -> &'static str;
    fn locate(&self, image: &RasterImage) -> Result<AnchorSet, SheetError>;
}

pub type BoxedStrategy = Box<dyn AnchorStrategy + Send + Sync>;

/// Tries every strategy in order and keeps the first that succeeds.
pub fn locate_anchors(
    image: &RasterImage,
    strategies: &[BoxedStrategy],
) -> Result<AnchorSet, SheetError> {
    for strategy in strategies {
        match strategy.locate(image) {
            Ok(anchors) => {
                log::debug!("anchor strategy `{}` succeeded", strategy.name());
                return Ok(anchors);
            }
            Err(e @ SheetError::InsufficientMarkers { .. }) | Err(e @ SheetError::AnchorNotFound) => {
                log::warn!("anchor strategy `{}` failed: {e}", strategy.name());
            }
            Err(e) => err_log!(&e),
        }
    }
    Err(SheetError::AnchorNotFound)
}

pub struct MarkerAnchorStrategy {
    config: MarkerConfig,
}

impl MarkerAnchorStrategy {
    pub fn new(config: MarkerConfig) -> MarkerAnchorStrategy {
        MarkerAnchorStrategy { config }
    }
}

impl AnchorStrategy for MarkerAnchorStrategy {
    fn name(&self) -> &'static str {
        "markers"
    }

    fn locate(&self, image: &RasterImage) -> Result<AnchorSet, SheetError> {
        let markers = detect_markers(image.mat(), &self.config)?;
        log::debug!("markers found: {}", markers.len());
        if markers.len() < 4 {
            return Err(SheetError::InsufficientMarkers {
                found: markers.len(),
            });
        }
        let centers: Vec<(f64, f64)> = markers.iter().map(|m| m.center).collect();
        let min_area = self.config.min_frame_area_frac * (image.width() as f64 * image.height() as f64);
        let frames_sheet = order_corners(&centers)
            .and_then(|corners| quad_shape(&corners))
            .is_some_and(|shape| shape.area >= min_area && shape.min_sine >= self.config.min_corner_sine);
        if !frames_sheet {
            log::debug!("{} markers do not frame the sheet", markers.len());
            return Err(SheetError::InsufficientMarkers {
                found: markers.len(),
            });
        }
        Ok(AnchorSet::Markers(
            markers
                .into_iter()
                .map(|m| AnchorPoint {
                    x: m.center.0,
                    y: m.center.1,
                    confidence: 1.0,
                    source: AnchorSource::Marker,
                })
                .collect(),
        ))
    }
}

/// Finds small filled squares anywhere on the sheet, sorted top-to-bottom then
/// left-to-right.
pub fn detect_markers(gray: &Mat, config: &MarkerConfig) -> Result<Vec<Marker>, SheetError> {
    let thresholded = {
        let mut mat_thresh = Mat::default();
        _ = imgproc::threshold(gray, &mut mat_thresh, 0.0, 255.0, THRESH_BINARY_INV | THRESH_OTSU)?;
        mat_thresh
    };
    // close small holes
    let closed = {
        let kernel = imgproc::get_structuring_element(
            MORPH_RECT,
            Size::new(config.close_kernel, config.close_kernel),
            Point::new(-1, -1),
        )?;
        let mut mat_closed = Mat::default();
        imgproc::morphology_ex_def(&thresholded, &mut mat_closed, MORPH_CLOSE, &kernel)?;
        mat_closed
    };

    let contours: Vector<Vector<Point>> = {
        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours_def(&closed, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)?;
        contours
    };

    let mut markers = Vec::new();
    for contour in contours.iter() {
        let area = imgproc::contour_area_def(&contour)?;
        if area < config.min_area || area > config.max_area {
            continue;
        }
        let bbox = imgproc::bounding_rect(&contour)?;
        if bbox.height == 0 {
            continue;
        }
        let aspect = bbox.width as f64 / bbox.height as f64;
        if aspect < config.min_aspect || aspect > config.max_aspect {
            continue;
        }
        let peri = imgproc::arc_length(&contour, true)?;
        let mut approx: Vector<Point> = Vector::new();
        imgproc::approx_poly_dp(&contour, &mut approx, config.epsilon_frac * peri, true)?;
        if approx.len() != 4 {
            continue;
        }
        markers.push(Marker {
            bbox,
            center: (
                (bbox.x + bbox.width / 2) as f64,
                (bbox.y + bbox.height / 2) as f64,
            ),
            area,
        });
    }
    markers.sort_by_key(|m| (m.bbox.y, m.bbox.x));
    Ok(markers)
}

/// Looks for a printed landmark word with a text recognizer.
pub struct TextAnchorStrategy<R: TextRecognizer> {
    recognizer: R,
    config: TextAnchorConfig,
}

impl<R: TextRecognizer> TextAnchorStrategy<R> {
    pub fn new(recognizer: R, config: TextAnchorConfig) -> TextAnchorStrategy<R> {
        TextAnchorStrategy { recognizer, config }
    }
}

impl<R: TextRecognizer> AnchorStrategy for TextAnchorStrategy<R> {
    fn name(&self) -> &'static str {
        "text"
    }

    fn locate(&self, image: &RasterImage) -> Result<AnchorSet, SheetError> {
        let binary = {
            let mut mat_thresh = Mat::default();
            _ = imgproc::threshold(
                image.mat(),
                &mut mat_thresh,
                0.0,
                255.0,
                THRESH_BINARY_INV | THRESH_OTSU,
            )?;
            mat_thresh
        };
        let words = self.recognizer.recognize_words(&binary)?;
        log::debug!("text recognizer returned {} words", words.len());
        select_text_anchor(&words, &self.config)
            .map(AnchorSet::Text)
            .ok_or(SheetError::AnchorNotFound)
    }
}

/// The first confident primary keyword wins. The fallback keyword is only
/// consulted when the primary is absent, and is shifted by the fallback offset.
pub fn select_text_anchor(
    words: &[RecognizedWord],
    config: &TextAnchorConfig,
) -> Option<AnchorPoint> {
    let keyword = normalize_token(&config.keyword);
    let primary = words.iter().find(|w| {
        w.confidence > config.min_confidence && normalize_token(&w.text).contains(&keyword)
    });
    if let Some(word) = primary {
        log::info!("anchor `{}` found at x={}, y={}", word.text, word.left, word.top);
        return Some(AnchorPoint {
            x: word.left as f64,
            y: word.top as f64,
            confidence: word.confidence,
            source: AnchorSource::TextKeyword,
        });
    }

    let fallback = normalize_token(&config.fallback_keyword);
    let word = words
        .iter()
        .find(|w| normalize_token(&w.text).contains(&fallback))?;
    let (dx, dy) = config.fallback_offset;
    log::warn!(
        "primary anchor `{}` not found, using fallback `{}`",
        config.keyword,
        word.text
    );
    Some(AnchorPoint {
        x: (word.left + dx) as f64,
        y: (word.top + dy) as f64,
        confidence: word.confidence,
        source: AnchorSource::TextFallback,
    })
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::errors::OcrError;
    use opencv::core::{Scalar, CV_8UC1};
    use opencv::imgproc::{FILLED, LINE_8};

    fn word(text: &str, confidence: f32, left: i32, top: i32) -> RecognizedWord {
        RecognizedWord {
            text: text.to_string(),
            confidence,
            left,
            top,
            width: 50,
            height: 20,
        }
    }

    fn blank(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC1, Scalar::all(255.0)).unwrap()
    }

    fn draw_square(mat: &mut Mat, cx: i32, cy: i32, side: i32) {
        imgproc::rectangle(
            mat,
            Rect::new(cx - side / 2, cy - side / 2, side, side),
            Scalar::all(0.0),
            FILLED,
            LINE_8,
            0,
        )
        .unwrap();
    }

    struct FixedWords(Vec<RecognizedWord>);

    impl TextRecognizer for FixedWords {
        fn recognize_words(&self, _image: &Mat) -> Result<Vec<RecognizedWord>, OcrError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_primary_keyword_needs_confidence() {
        let config = TextAnchorConfig::default();
        let words = vec![
            word("ASSINATURA", 20.0, 10, 10),
            word("Assinatura:", 85.0, 108, 92),
        ];
        let anchor = select_text_anchor(&words, &config).unwrap();
        assert_eq!((anchor.x, anchor.y), (108.0, 92.0));
        assert_eq!(anchor.source, AnchorSource::TextKeyword);
    }

    #[test]
    fn test_fallback_applies_offset() {
        let config = TextAnchorConfig::default();
        let words = vec![word("SIMULADO", 70.0, 400, 50)];
        let anchor = select_text_anchor(&words, &config).unwrap();
        assert_eq!((anchor.x, anchor.y), (120.0, 60.0));
        assert_eq!(anchor.source, AnchorSource::TextFallback);
    }

    #[test]
    fn test_fallback_ignored_when_primary_present() {
        let config = TextAnchorConfig::default();
        let words = vec![
            word("Simulado", 90.0, 400, 50),
            word("Assinatúra", 90.0, 100, 100),
        ];
        let anchor = select_text_anchor(&words, &config).unwrap();
        assert_eq!(anchor.source, AnchorSource::TextKeyword);
        assert_eq!(anchor.x, 100.0);
    }

    #[test]
    fn test_no_keyword_gives_none() {
        let words = vec![word("Nome", 95.0, 0, 0)];
        assert!(select_text_anchor(&words, &TextAnchorConfig::default()).is_none());
    }

    #[test]
    fn test_detect_four_markers() {
        let mut mat = blank(400, 300);
        for (cx, cy) in [(30, 30), (270, 30), (30, 370), (270, 370)] {
            draw_square(&mut mat, cx, cy, 20);
        }
        let raster = RasterImage::from_mat(mat.try_clone().unwrap()).unwrap();
        let located = MarkerAnchorStrategy::new(MarkerConfig::default()).locate(&raster);
        assert!(matches!(located, Ok(AnchorSet::Markers(ref points)) if points.len() == 4));

        let markers = detect_markers(&mat, &MarkerConfig::default()).unwrap();
        assert_eq!(markers.len(), 4);
        // sorted by y then x
        assert!(markers[0].center.0 < markers[1].center.0);
        assert!((markers[0].center.0 - 30.0).abs() <= 2.0);
        assert!((markers[3].center.1 - 370.0).abs() <= 2.0);
    }

    #[test]
    fn test_circles_are_not_markers() {
        let mut mat = blank(200, 200);
        imgproc::circle(
            &mut mat,
            Point::new(100, 100),
            15,
            Scalar::all(0.0),
            FILLED,
            LINE_8,
            0,
        )
        .unwrap();
        let markers = detect_markers(&mat, &MarkerConfig::default()).unwrap();
        assert!(markers.is_empty());
    }

    #[test]
    fn test_marker_strategy_reports_insufficient() {
        let mut mat = blank(300, 300);
        draw_square(&mut mat, 40, 40, 20);
        draw_square(&mut mat, 260, 40, 20);
        let raster = RasterImage::from_mat(mat).unwrap();
        let result = MarkerAnchorStrategy::new(MarkerConfig::default()).locate(&raster);
        assert!(matches!(
            result,
            Err(SheetError::InsufficientMarkers { found: 2 })
        ));
    }

    #[test]
    fn test_chain_falls_through_to_text() {
        let raster = RasterImage::from_mat(blank(300, 300)).unwrap();
        let strategies: Vec<BoxedStrategy> = vec![
            Box::new(MarkerAnchorStrategy::new(MarkerConfig::default())),
            Box::new(TextAnchorStrategy::new(
                FixedWords(vec![word("assinatura", 99.0, 12, 34)]),
                TextAnchorConfig::default(),
            )),
        ];
        let anchors = locate_anchors(&raster, &strategies).unwrap();
        match anchors {
            AnchorSet::Text(point) => assert_eq!((point.x, point.y), (12.0, 34.0)),
            other => panic!("unexpected anchors {other:?}"),
        }
    }

    #[test]
    fn test_markers_in_a_row_do_not_frame_the_sheet() {
        let mut mat = blank(300, 600);
        for cx in [60, 200, 340, 480] {
            draw_square(&mut mat, cx, 40, 20);
        }
        let raster = RasterImage::from_mat(mat).unwrap();
        let result = MarkerAnchorStrategy::new(MarkerConfig::default()).locate(&raster);
        assert!(matches!(
            result,
            Err(SheetError::InsufficientMarkers { found: 4 })
        ));
    }

    #[test]
    fn test_small_marker_cluster_does_not_frame_the_sheet() {
        let mut mat = blank(600, 600);
        for (cx, cy) in [(250, 250), (330, 250), (330, 330), (250, 330)] {
            draw_square(&mut mat, cx, cy, 20);
        }
        let raster = RasterImage::from_mat(mat).unwrap();
        let result = MarkerAnchorStrategy::new(MarkerConfig::default()).locate(&raster);
        assert!(matches!(result, Err(SheetError::InsufficientMarkers { .. })));
    }

    #[test]
    fn test_chain_falls_through_on_marker_strip() {
        let mut mat = blank(300, 600);
        for cx in [60, 200, 340, 480] {
            draw_square(&mut mat, cx, 40, 20);
        }
        let raster = RasterImage::from_mat(mat).unwrap();
        let strategies: Vec<BoxedStrategy> = vec![
            Box::new(MarkerAnchorStrategy::new(MarkerConfig::default())),
            Box::new(TextAnchorStrategy::new(
                FixedWords(vec![word("Assinatura", 95.0, 70, 120)]),
                TextAnchorConfig::default(),
            )),
        ];
        match locate_anchors(&raster, &strategies).unwrap() {
            AnchorSet::Text(point) => assert_eq!((point.x, point.y), (70.0, 120.0)),
            other => panic!("unexpected anchors {other:?}"),
        }
    }

    #[test]
    fn test_chain_without_anchor_fails() {
        let raster = RasterImage::from_mat(blank(300, 300)).unwrap();
        let strategies: Vec<BoxedStrategy> = vec![
            Box::new(MarkerAnchorStrategy::new(MarkerConfig::default())),
            Box::new(TextAnchorStrategy::new(
                FixedWords(vec![word("Nome", 99.0, 0, 0)]),
                TextAnchorConfig::default(),
            )),
        ];
        let result = locate_anchors(&raster, &strategies);
        assert!(matches!(result, Err(SheetError::AnchorNotFound)));
    }
}
