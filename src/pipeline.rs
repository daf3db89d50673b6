//! Per-sheet orchestration: normalize, anchor, resolve, then read every block.
//!
//! A sheet always produces a [`SheetReport`]. Failures are recorded in it with
//! the region they hit, so a batch never stops on one bad sheet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use opencv::core::{Mat, Rect};
use opencv::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::anchor::{locate_anchors, BoxedStrategy, MarkerAnchorStrategy, TextAnchorStrategy};
use crate::assemble::{decode_identifier, Answer, AnswerSheetBuilder, IdentifierCode, IdentifierReading};
use crate::bubbles::{detect_bubbles, BubbleCandidate};
use crate::config::{AnchorStrategyKind, OmrConfig, RegionKind};
use crate::diagnostics::{
    draw_anchors, draw_candidates, draw_decisions, DecisionMark, DiagnosticMode, DiagnosticSink,
    Stage,
};
use crate::errors::{OcrError, SheetError};
use crate::fill::{best_cell, mask_radius, score_row, FillScore, RowDecision};
use crate::grid::{infer_layout, Confidence, GridCell, GridLayout};
use crate::image::{normalize, read_from_path, RasterImage};
use crate::ocr::OcrEngine;
use crate::region::{resolve_regions, CalibrationFrame};

/// What a sheet ended up producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetOutcome {
    Both,
    AnswersOnly,
    IdentifierOnly,
    Neither,
}

impl SheetOutcome {
    pub fn of(has_answers: bool, has_identifier: bool) -> SheetOutcome {
        match (has_answers, has_identifier) {
            (true, true) => SheetOutcome::Both,
            (true, false) => SheetOutcome::AnswersOnly,
            (false, true) => SheetOutcome::IdentifierOnly,
            (false, false) => SheetOutcome::Neither,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Load,
    Image,
    Ocr,
    AnchorNotFound,
    InsufficientMarkers,
    NoBubblesDetected,
    GridShapeMismatch,
    CodeUnreadable,
}

impl From<&SheetError> for FailureKind {
    fn from(err: &SheetError) -> Self {
        match err {
            SheetError::Load(_) => FailureKind::Load,
            SheetError::OpenCvError(_) => FailureKind::Image,
            SheetError::OcrError(_) => FailureKind::Ocr,
            SheetError::AnchorNotFound => FailureKind::AnchorNotFound,
            SheetError::InsufficientMarkers { .. } => FailureKind::InsufficientMarkers,
            SheetError::NoBubblesDetected { .. } => FailureKind::NoBubblesDetected,
            SheetError::GridShapeMismatch { .. } => FailureKind::GridShapeMismatch,
            SheetError::CodeUnreadable { .. } => FailureKind::CodeUnreadable,
        }
    }
}

/// A recorded failure. `region` is `None` when the whole sheet was lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFailure {
    #[serde(default)]
    pub page: usize,
    pub region: Option<RegionKind>,
    pub kind: FailureKind,
    pub message: String,
}

impl BlockFailure {
    pub fn new(region: Option<RegionKind>, err: &SheetError) -> BlockFailure {
        BlockFailure {
            page: 0,
            region,
            kind: err.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetReport {
    pub source: String,
    pub outcome: SheetOutcome,
    pub answers: Option<Vec<Answer>>,
    pub identifier: Option<IdentifierCode>,
    pub confidence: Confidence,
    pub failures: Vec<BlockFailure>,
    /// Stage name to PNG data URL, when diagnostics are kept in memory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub diagnostics: BTreeMap<String, String>,
}

impl SheetReport {
    pub fn empty(source: impl Into<String>) -> SheetReport {
        SheetReport {
            source: source.into(),
            outcome: SheetOutcome::Neither,
            answers: None,
            identifier: None,
            confidence: Confidence::Normal,
            failures: Vec::new(),
            diagnostics: BTreeMap::new(),
        }
    }

    fn settle(mut self) -> SheetReport {
        self.outcome = SheetOutcome::of(self.answers.is_some(), self.identifier.is_some());
        self
    }

    pub fn has_failure(&self, kind: FailureKind) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubBlockReading {
    pub first_question: u32,
    pub cells: Vec<Vec<GridCell>>,
    pub scores: Vec<Vec<FillScore>>,
    pub decisions: Vec<RowDecision>,
}

/// Everything read from one answer region, in region coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerBlockReading {
    pub candidates: Vec<BubbleCandidate>,
    pub layout: GridLayout,
    pub radius: i32,
    pub sub_blocks: Vec<SubBlockReading>,
}

impl AnswerBlockReading {
    pub fn record_into(&self, builder: &mut AnswerSheetBuilder) {
        for sub in &self.sub_blocks {
            builder.record_rows(sub.first_question, &sub.decisions);
        }
    }

    /// This block alone, as a contiguous vector from question 1.
    pub fn answers(&self) -> Vec<Answer> {
        let mut builder = AnswerSheetBuilder::new();
        self.record_into(&mut builder);
        builder.finish()
    }

    fn decision_marks(&self, origin: Rect) -> Vec<DecisionMark> {
        let mut marks = Vec::new();
        for sub in &self.sub_blocks {
            for ((cells, scores), decision) in sub.cells.iter().zip(&sub.scores).zip(&sub.decisions) {
                let Some((best, _)) = best_cell(scores) else {
                    continue;
                };
                let (x, y) = cells[best].center;
                marks.push(DecisionMark {
                    center: (origin.x + x, origin.y + y),
                    label: Answer::from_decision(decision).to_string(),
                    marked: decision.column().is_some(),
                });
            }
        }
        marks
    }
}

/// Detects, clusters and classifies the bubbles of one answer region.
pub fn read_answer_block(
    region: &Mat,
    first_question: u32,
    config: &OmrConfig,
) -> Result<AnswerBlockReading, SheetError> {
    let detection = detect_bubbles(region, &config.bubbles, config.grid.alternatives)?;
    let layout = infer_layout(&detection.candidates, first_question, &config.grid);
    let radius = mask_radius(
        detection.mean_width(),
        config.fill.radius_factor,
        config.fill.min_radius,
    );

    let mut sub_blocks = Vec::with_capacity(layout.sub_blocks.len());
    for sub in &layout.sub_blocks {
        let cells = layout.cells(sub, radius);
        let mut scores = Vec::with_capacity(cells.len());
        let mut decisions = Vec::with_capacity(cells.len());
        for row in &cells {
            let centers: Vec<(i32, i32)> = row.iter().map(|cell| cell.center).collect();
            let (row_scores, decision) = score_row(&detection.binary, &centers, radius, &config.fill)?;
            scores.push(row_scores);
            decisions.push(decision);
        }
        let marked = decisions.iter().filter(|d| d.column().is_some()).count();
        log::debug!(
            "block from question {}: {marked} of {} rows marked",
            sub.first_question,
            decisions.len()
        );
        sub_blocks.push(SubBlockReading {
            first_question: sub.first_question,
            cells,
            scores,
            decisions,
        });
    }

    Ok(AnswerBlockReading {
        candidates: detection.candidates,
        layout,
        radius,
        sub_blocks,
    })
}

fn identifier_marks(reading: &IdentifierReading, origin: Rect, placeholder: char) -> Vec<DecisionMark> {
    reading
        .columns
        .iter()
        .filter_map(|column| {
            let (best, _) = best_cell(&column.scores)?;
            let (x, y) = column.bubbles[best].center;
            Some(DecisionMark {
                center: (origin.x + x, origin.y + y),
                label: column
                    .symbol_index
                    .map_or(placeholder.to_string(), |d| d.to_string()),
                marked: column.symbol_index.is_some(),
            })
        })
        .collect()
}

/// Builds the configured anchor strategies in order.
///
/// The text strategy needs the external recognizer, so this fails with
/// `NoTesseract` when it is configured but unavailable.
pub fn build_strategies(config: &OmrConfig) -> Result<Vec<BoxedStrategy>, OcrError> {
    let mut strategies: Vec<BoxedStrategy> = Vec::new();
    for kind in &config.anchors.strategies {
        match kind {
            AnchorStrategyKind::Markers => {
                strategies.push(Box::new(MarkerAnchorStrategy::new(config.markers.clone())))
            }
            AnchorStrategyKind::Text => {
                let engine = OcrEngine::new(&config.ocr)?;
                strategies.push(Box::new(TextAnchorStrategy::new(
                    engine,
                    config.text_anchor.clone(),
                )))
            }
        }
    }
    Ok(strategies)
}

/// Reads answer sheets with one configuration. Holds no per-sheet state, so one
/// reader serves a whole parallel batch.
pub struct SheetReader {
    config: OmrConfig,
    strategies: Vec<BoxedStrategy>,
    diagnostics: DiagnosticMode,
}

impl SheetReader {
    pub fn new(config: OmrConfig) -> Result<SheetReader, OcrError> {
        let strategies = build_strategies(&config)?;
        Ok(SheetReader::with_strategies(config, strategies))
    }

    pub fn with_strategies(config: OmrConfig, strategies: Vec<BoxedStrategy>) -> SheetReader {
        let diagnostics = match &config.diagnostics.output_dir {
            Some(dir) => DiagnosticMode::Directory(dir.clone()),
            None => DiagnosticMode::Off,
        };
        SheetReader {
            config,
            strategies,
            diagnostics,
        }
    }

    pub fn with_diagnostics(mut self, mode: DiagnosticMode) -> SheetReader {
        self.diagnostics = mode;
        self
    }

    pub fn config(&self) -> &OmrConfig {
        &self.config
    }

    pub fn read_path(&self, path: &Path) -> SheetReport {
        let source = path.display().to_string();
        log::info!("reading {source}");
        match read_from_path(path) {
            Ok(raster) => self.read_raster(&raster, &source),
            Err(e) => {
                let err = SheetError::from(e);
                log::warn!("{source}: {err}");
                let mut report = SheetReport::empty(source);
                report.failures.push(BlockFailure::new(None, &err));
                report.settle()
            }
        }
    }

    pub fn read_raster(&self, raster: &RasterImage, source: &str) -> SheetReport {
        let stem = Path::new(source)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sheet".to_string());
        let mut sink = DiagnosticSink::new(self.diagnostics.clone(), stem);
        let mut report = SheetReport::empty(source);
        if let Err(e) = self.read_into(raster, &mut sink, &mut report) {
            log::warn!("{source}: {e}");
            report.failures.push(BlockFailure::new(None, &e));
        }
        report.diagnostics = sink.into_data_urls();
        report.settle()
    }

    fn read_into(
        &self,
        raster: &RasterImage,
        sink: &mut DiagnosticSink,
        report: &mut SheetReport,
    ) -> Result<(), SheetError> {
        let config = &self.config;
        let image = normalize(raster, config.raster.working_width)?;
        let anchors = locate_anchors(&image, &self.strategies)?;
        sink.emit(Stage::Markers, || draw_anchors(image.mat(), &anchors));

        let regions = resolve_regions(&image, &anchors, &config.perspective, &config.template)?;
        if let CalibrationFrame::Homography { width, height, .. } = regions.frame {
            log::debug!("reading in canonical {width}x{height} frame");
            sink.emit(Stage::Rectified, || regions.image.mat().try_clone());
        }

        let mut builder = AnswerSheetBuilder::new();
        let mut drawn_blocks: Vec<(Rect, Vec<BubbleCandidate>)> = Vec::new();
        let mut marks: Vec<DecisionMark> = Vec::new();
        for block in &regions.blocks {
            let region = Mat::roi(regions.image.mat(), block.rect)?.try_clone()?;
            match block.kind {
                RegionKind::Answers { first_question } => {
                    match read_answer_block(&region, first_question, config) {
                        Ok(reading) => {
                            reading.record_into(&mut builder);
                            if let Some(e) = reading.layout.shape_error(&config.grid) {
                                log::warn!("{}: {e}", report.source);
                                report.failures.push(BlockFailure::new(Some(block.kind), &e));
                            }
                            if reading.layout.confidence == Confidence::Low {
                                report.confidence = Confidence::Low;
                            }
                            if sink.is_enabled() {
                                marks.extend(reading.decision_marks(block.rect));
                                drawn_blocks.push((block.rect, reading.candidates));
                            }
                        }
                        Err(e) => {
                            log::warn!("{}: answer block from question {first_question}: {e}", report.source);
                            report.failures.push(BlockFailure::new(Some(block.kind), &e));
                        }
                    }
                }
                RegionKind::Identifier => {
                    match decode_identifier(&region, &config.identifier, config.fill.threshold) {
                        Ok(reading) => {
                            log::info!("{}: identifier {}", report.source, reading.code);
                            if sink.is_enabled() {
                                marks.extend(identifier_marks(
                                    &reading,
                                    block.rect,
                                    config.identifier.placeholder,
                                ));
                                drawn_blocks.push((
                                    block.rect,
                                    reading.columns.iter().flat_map(|c| c.bubbles.clone()).collect(),
                                ));
                            }
                            report.identifier = Some(reading.code);
                        }
                        Err(e) => {
                            log::warn!("{}: identifier: {e}", report.source);
                            report.failures.push(BlockFailure::new(Some(block.kind), &e));
                        }
                    }
                }
            }
        }

        sink.emit(Stage::Candidates, || draw_candidates(regions.image.mat(), &drawn_blocks));
        sink.emit(Stage::Decisions, || draw_decisions(regions.image.mat(), &marks));
        if !builder.is_empty() {
            report.answers = Some(builder.finish());
        }
        Ok(())
    }

    /// Reads every file as one page of the same sheet. Pages are read in parallel
    /// and composed in order.
    pub fn read_pages(&self, paths: &[PathBuf]) -> SheetReport {
        let pages: Vec<SheetReport> = paths.par_iter().map(|path| self.read_path(path)).collect();
        compose_pages(pages, self.config.pages.question_offset_per_page)
    }

    /// Reads every file as an independent sheet.
    pub fn process_batch(&self, paths: &[PathBuf]) -> Vec<SheetReport> {
        paths.par_iter().map(|path| self.read_path(path)).collect()
    }
}

/// Merges page reports: page `k` answers shift by `k * offset_per_page`, and the
/// first identifier found is kept.
pub fn compose_pages(pages: Vec<SheetReport>, offset_per_page: u32) -> SheetReport {
    let source = pages
        .iter()
        .map(|page| page.source.as_str())
        .collect::<Vec<_>>()
        .join("+");
    let multi_page = pages.len() > 1;
    let mut builder = AnswerSheetBuilder::new();
    let mut report = SheetReport::empty(source);

    for (k, page) in pages.into_iter().enumerate() {
        if let Some(answers) = &page.answers {
            builder.record_vector(k as u32 * offset_per_page, answers);
        }
        if report.identifier.is_none() {
            report.identifier = page.identifier;
        }
        if page.confidence == Confidence::Low {
            report.confidence = Confidence::Low;
        }
        report
            .failures
            .extend(page.failures.into_iter().map(|f| BlockFailure { page: k, ..f }));
        for (stage, url) in page.diagnostics {
            let key = if multi_page {
                format!("page{}_{stage}", k + 1)
            } else {
                stage
            };
            report.diagnostics.insert(key, url);
        }
    }
    if !builder.is_empty() {
        report.answers = Some(builder.finish());
    }
    report.settle()
}
