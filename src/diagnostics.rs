//! Annotated stage dumps. Purely informational: a failure here is logged and
//! never affects the reading.

use std::collections::BTreeMap;
use std::path::PathBuf;

use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc::{self, FILLED, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::*;

use crate::anchor::AnchorSet;
use crate::bubbles::BubbleCandidate;
use crate::err_log;
use crate::errors::DiagnosticsError;
use crate::image::{encode_png, mat_to_base64_png};

#[derive(Debug, Clone, Default, PartialEq)]
pub enum DiagnosticMode {
    #[default]
    Off,
    /// PNG files named `<stem>_<stage>.png` in this directory.
    Directory(PathBuf),
    /// PNG data URLs kept in the sheet report.
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Markers,
    Rectified,
    Candidates,
    Decisions,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Markers => "markers",
            Stage::Rectified => "rectified",
            Stage::Candidates => "candidates",
            Stage::Decisions => "decisions",
        }
    }
}

/// Per-sheet collector of stage images.
#[derive(Debug)]
pub struct DiagnosticSink {
    mode: DiagnosticMode,
    stem: String,
    data_urls: BTreeMap<String, String>,
}

impl DiagnosticSink {
    pub fn new(mode: DiagnosticMode, stem: impl Into<String>) -> DiagnosticSink {
        DiagnosticSink {
            mode,
            stem: stem.into(),
            data_urls: BTreeMap::new(),
        }
    }

    pub fn disabled() -> DiagnosticSink {
        DiagnosticSink::new(DiagnosticMode::Off, "")
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != DiagnosticMode::Off
    }

    /// Renders with `draw` and stores the result. Drawing is skipped entirely when
    /// the sink is off.
    pub fn emit<F>(&mut self, stage: Stage, draw: F)
    where
        F: FnOnce() -> opencv::Result<Mat>,
    {
        if !self.is_enabled() {
            return;
        }
        let result = draw()
            .map_err(DiagnosticsError::from)
            .and_then(|mat| self.store(stage, &mat));
        if let Err(e) = result {
            err_log!(&e);
        }
    }

    fn store(&mut self, stage: Stage, mat: &Mat) -> Result<(), DiagnosticsError> {
        match &self.mode {
            DiagnosticMode::Off => Ok(()),
            DiagnosticMode::Directory(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}_{}.png", self.stem, stage.name()));
                std::fs::write(&path, encode_png(mat)?)?;
                log::info!("{} saved to {}", stage.name(), path.display());
                Ok(())
            }
            DiagnosticMode::InMemory => {
                self.data_urls
                    .insert(stage.name().to_string(), mat_to_base64_png(mat)?);
                Ok(())
            }
        }
    }

    pub fn into_data_urls(self) -> BTreeMap<String, String> {
        self.data_urls
    }
}

/// A per-row decision to annotate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionMark {
    pub center: (i32, i32),
    pub label: String,
    pub marked: bool,
}

const RED: (f64, f64, f64) = (0.0, 0.0, 255.0);
const GREEN: (f64, f64, f64) = (0.0, 255.0, 0.0);
const BLUE: (f64, f64, f64) = (255.0, 0.0, 0.0);

fn scalar((b, g, r): (f64, f64, f64)) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

pub fn to_color(gray: &Mat) -> opencv::Result<Mat> {
    if gray.channels() != 1 {
        return gray.try_clone();
    }
    let mut color = Mat::default();
    imgproc::cvt_color_def(gray, &mut color, imgproc::COLOR_GRAY2BGR)?;
    Ok(color)
}

pub fn draw_anchors(gray: &Mat, anchors: &AnchorSet) -> opencv::Result<Mat> {
    let mut debug_image = to_color(gray)?;
    let points = match anchors {
        AnchorSet::Text(point) => std::slice::from_ref(point),
        AnchorSet::Markers(points) => points.as_slice(),
    };
    for point in points {
        imgproc::circle(
            &mut debug_image,
            Point::new(point.x as i32, point.y as i32),
            10,
            scalar(RED),
            FILLED,
            LINE_8,
            0,
        )?;
    }
    Ok(debug_image)
}

/// Outlines every block and circles its candidates. Candidate coordinates are
/// relative to their block.
pub fn draw_candidates(
    gray: &Mat,
    blocks: &[(Rect, Vec<BubbleCandidate>)],
) -> opencv::Result<Mat> {
    let mut debug_image = to_color(gray)?;
    for (rect, candidates) in blocks {
        imgproc::rectangle(&mut debug_image, *rect, scalar(RED), 2, LINE_8, 0)?;
        for c in candidates {
            imgproc::circle(
                &mut debug_image,
                Point::new(rect.x + c.center.0, rect.y + c.center.1),
                c.width.max(c.height) / 2,
                scalar(BLUE),
                1,
                LINE_8,
                0,
            )?;
        }
    }
    Ok(debug_image)
}

/// Writes each decision's label next to its cell, green when marked.
pub fn draw_decisions(gray: &Mat, marks: &[DecisionMark]) -> opencv::Result<Mat> {
    let mut debug_image = to_color(gray)?;
    for mark in marks {
        let color = if mark.marked { GREEN } else { RED };
        imgproc::put_text(
            &mut debug_image,
            &mark.label,
            Point::new(mark.center.0 - 10, mark.center.1 + 6),
            FONT_HERSHEY_SIMPLEX,
            0.6,
            scalar(color),
            2,
            LINE_8,
            false,
        )?;
    }
    Ok(debug_image)
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::anchor::{AnchorPoint, AnchorSource};
    use opencv::core::CV_8UC1;

    fn gray() -> Mat {
        Mat::new_rows_cols_with_default(60, 80, CV_8UC1, Scalar::all(255.0)).unwrap()
    }

    #[test]
    fn test_disabled_sink_never_draws() {
        let mut sink = DiagnosticSink::disabled();
        let mut called = false;
        sink.emit(Stage::Markers, || {
            called = true;
            Ok(Mat::default())
        });
        assert!(!called);
        assert!(sink.into_data_urls().is_empty());
    }

    #[test]
    fn test_in_memory_sink_keeps_data_urls() {
        let mut sink = DiagnosticSink::new(DiagnosticMode::InMemory, "sheet");
        let anchors = AnchorSet::Text(AnchorPoint {
            x: 20.0,
            y: 20.0,
            confidence: 90.0,
            source: AnchorSource::TextKeyword,
        });
        sink.emit(Stage::Markers, || draw_anchors(&gray(), &anchors));
        let urls = sink.into_data_urls();
        assert!(urls["markers"].starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_directory_sink_writes_named_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            DiagnosticSink::new(DiagnosticMode::Directory(dir.path().join("debug")), "page1");
        let marks = [DecisionMark {
            center: (30, 30),
            label: "A".to_string(),
            marked: true,
        }];
        sink.emit(Stage::Decisions, || draw_decisions(&gray(), &marks));
        assert!(dir.path().join("debug").join("page1_decisions.png").exists());
    }

    #[test]
    fn test_failed_drawing_is_swallowed() {
        let mut sink = DiagnosticSink::new(DiagnosticMode::InMemory, "x");
        sink.emit(Stage::Rectified, || Ok(Mat::default()));
        assert!(sink.into_data_urls().is_empty());
    }

    #[test]
    fn test_candidates_are_drawn_in_color() {
        let candidate = BubbleCandidate {
            x: 5,
            y: 5,
            width: 10,
            height: 10,
            center: (10, 10),
            area: 80.0,
            aspect: 1.0,
        };
        let blocks = [(Rect::new(10, 10, 40, 30), vec![candidate])];
        let mat = draw_candidates(&gray(), &blocks).unwrap();
        assert_eq!(mat.channels(), 3);
        assert_eq!((mat.cols(), mat.rows()), (80, 60));
    }
}
