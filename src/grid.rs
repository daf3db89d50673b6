//! One-dimensional clustering of bubble centers into rows and columns, and the
//! column layout of answer blocks.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::bubbles::BubbleCandidate;
use crate::config::{GridConfig, RowRepair};
use crate::errors::SheetError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    /// `max(floor, median_gap * factor)`
    Auto,
    Fixed(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Normal,
    Low,
}

/// Median of the gaps between consecutive values of a sorted slice.
pub fn median_gap(sorted: &[i32]) -> Option<f64> {
    let gaps: Vec<i32> = sorted
        .iter()
        .tuple_windows()
        .map(|(a, b)| b - a)
        .sorted()
        .collect();
    if gaps.is_empty() {
        return None;
    }
    let mid = gaps.len() / 2;
    if gaps.len() % 2 == 0 {
        Some((gaps[mid - 1] + gaps[mid]) as f64 / 2.0)
    } else {
        Some(gaps[mid] as f64)
    }
}

pub fn resolve_tolerance(sorted: &[i32], tolerance: Tolerance, config: &GridConfig) -> f64 {
    match tolerance {
        Tolerance::Fixed(tol) => tol,
        Tolerance::Auto => {
            let median = median_gap(sorted).unwrap_or(0.0);
            config.tolerance_floor.max(median * config.tolerance_factor)
        }
    }
}

/// Collapses positions into cluster centers, ascending.
///
/// Duplicates are dropped first, so the median gap reflects distinct positions.
/// A cluster ends where the next gap exceeds the tolerance and is reported as the
/// rounded mean of its members.
pub fn cluster_positions(values: &[i32], tolerance: Tolerance, config: &GridConfig) -> Vec<i32> {
    let sorted: Vec<i32> = values.iter().copied().sorted().dedup().collect();
    if sorted.is_empty() {
        return Vec::new();
    }
    let tol = resolve_tolerance(&sorted, tolerance, config);

    let mut clusters: Vec<Vec<i32>> = vec![vec![sorted[0]]];
    for (prev, value) in sorted.iter().tuple_windows() {
        if (value - prev) as f64 > tol {
            clusters.push(vec![*value]);
        } else if let Some(last) = clusters.last_mut() {
            last.push(*value);
        }
    }
    clusters
        .iter()
        .map(|members| {
            let sum: i64 = members.iter().map(|&v| v as i64).sum();
            (sum as f64 / members.len() as f64).round() as i32
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowClusters {
    pub positions: Vec<i32>,
    /// The median-gap repair pass produced these positions.
    pub repaired: bool,
}

impl RowClusters {
    pub fn in_band(&self, config: &GridConfig) -> bool {
        self.band_distance(config) == 0
    }

    /// How many rows short of, or over, the plausible band.
    fn band_distance(&self, config: &GridConfig) -> usize {
        let n = self.positions.len();
        config.min_rows.saturating_sub(n) + n.saturating_sub(config.max_rows)
    }
}

/// Row clustering with a single repair attempt when the count is implausible.
///
/// The repair reclusters with the median gap as tolerance and its result is
/// taken as is. With [`RowRepair::PreferCloser`] the first clustering is kept
/// instead when the repair lands further from the band.
pub fn infer_rows(ys: &[i32], config: &GridConfig) -> RowClusters {
    let positions = cluster_positions(ys, Tolerance::Auto, config);
    let first = RowClusters {
        positions,
        repaired: false,
    };
    if first.in_band(config) {
        return first;
    }

    let sorted: Vec<i32> = ys.iter().copied().sorted().dedup().collect();
    let Some(median) = median_gap(&sorted) else {
        return first;
    };
    log::debug!(
        "{} row clusters outside {}..={}, retrying with tolerance {median}",
        first.positions.len(),
        config.min_rows,
        config.max_rows
    );
    let repaired = RowClusters {
        positions: cluster_positions(ys, Tolerance::Fixed(median), config),
        repaired: true,
    };
    if config.row_repair == RowRepair::PreferCloser
        && repaired.band_distance(config) > first.band_distance(config)
    {
        log::debug!(
            "repair gave {} rows, keeping the first {}",
            repaired.positions.len(),
            first.positions.len()
        );
        return first;
    }
    repaired
}

/// A group of alternative columns sharing a question numbering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubBlock {
    pub first_question: u32,
    pub columns: Vec<i32>,
}

/// Splits column clusters into sub-blocks.
///
/// Nine or more clusters are two side-by-side blocks, the second starting
/// `second_block_offset` questions after the first. Five to eight are one block.
/// Anything else is kept whole at low confidence.
pub fn interpret_columns(
    columns: &[i32],
    first_question: u32,
    config: &GridConfig,
) -> (Vec<SubBlock>, Confidence) {
    let per_block = config.alternatives;
    let n = columns.len();
    if n + 1 >= 2 * per_block {
        let left = columns[..per_block].to_vec();
        let right = columns[per_block..n.min(2 * per_block)].to_vec();
        (
            vec![
                SubBlock {
                    first_question,
                    columns: left,
                },
                SubBlock {
                    first_question: first_question + config.second_block_offset,
                    columns: right,
                },
            ],
            Confidence::Normal,
        )
    } else if n >= per_block {
        (
            vec![SubBlock {
                first_question,
                columns: columns[..per_block].to_vec(),
            }],
            Confidence::Normal,
        )
    } else {
        log::warn!("only {n} column clusters found, reading them as a partial block");
        (
            vec![SubBlock {
                first_question,
                columns: columns.to_vec(),
            }],
            Confidence::Low,
        )
    }
}

/// One response slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridCell {
    pub row: usize,
    pub column: usize,
    pub center: (i32, i32),
    pub radius: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridLayout {
    pub rows: Vec<i32>,
    pub sub_blocks: Vec<SubBlock>,
    pub confidence: Confidence,
    pub repaired: bool,
}

impl GridLayout {
    /// Cells of `sub_block`, grouped by row.
    pub fn cells(&self, sub_block: &SubBlock, radius: i32) -> Vec<Vec<GridCell>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(row, &y)| {
                sub_block
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(column, &x)| GridCell {
                        row,
                        column,
                        center: (x, y),
                        radius,
                    })
                    .collect()
            })
            .collect()
    }

    /// `GridShapeMismatch` when the row count stayed outside the plausible band
    /// even after the repair pass.
    pub fn shape_error(&self, config: &GridConfig) -> Option<SheetError> {
        let rows = self.rows.len();
        if (config.min_rows..=config.max_rows).contains(&rows) {
            None
        } else {
            Some(SheetError::GridShapeMismatch {
                rows,
                min: config.min_rows,
                max: config.max_rows,
            })
        }
    }
}

/// Infers rows and columns from the candidates of an answer block.
pub fn infer_layout(
    candidates: &[BubbleCandidate],
    first_question: u32,
    config: &GridConfig,
) -> GridLayout {
    let xs: Vec<i32> = candidates.iter().map(|c| c.center.0).collect();
    let ys: Vec<i32> = candidates.iter().map(|c| c.center.1).collect();

    let columns = cluster_positions(&xs, Tolerance::Auto, config);
    let rows = infer_rows(&ys, config);
    let (sub_blocks, mut confidence) = interpret_columns(&columns, first_question, config);
    if !rows.in_band(config) {
        confidence = Confidence::Low;
    }
    log::debug!(
        "grid: {} columns, {} rows{}",
        columns.len(),
        rows.positions.len(),
        if rows.repaired { " (repaired)" } else { "" }
    );
    GridLayout {
        rows: rows.positions,
        sub_blocks,
        confidence,
        repaired: rows.repaired,
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    /// Deterministic jitter in `(-amplitude, amplitude)`.
    struct Lcg(u64);

    impl Lcg {
        fn next_jitter(&mut self, amplitude: i32) -> i32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let span = (2 * amplitude - 1) as u64;
            ((self.0 >> 33) % span) as i32 - (amplitude - 1)
        }
    }

    #[test]
    fn test_evenly_spaced_with_jitter_gives_n_clusters() {
        let config = GridConfig::default();
        let mut rng = Lcg(42);
        for spacing in [21, 26, 40, 64] {
            for n in [2, 5, 10, 45, 60] {
                let amplitude = (spacing as f64 / 4.0).ceil() as i32;
                let values: Vec<i32> = (0..n)
                    .map(|i| 100 + i * spacing + rng.next_jitter(amplitude))
                    .collect();
                let clusters = cluster_positions(&values, Tolerance::Auto, &config);
                assert_eq!(clusters.len(), n as usize, "spacing {spacing}, n {n}: {values:?}");
            }
        }
    }

    #[test]
    fn test_cluster_members_collapse_to_rounded_mean() {
        let config = GridConfig::default();
        let values = [100, 101, 103, 100, 150, 152, 149, 200];
        let clusters = cluster_positions(&values, Tolerance::Auto, &config);
        assert_eq!(clusters, vec![101, 150, 200]);
    }

    #[test]
    fn test_fixed_tolerance_overrides_floor() {
        let config = GridConfig::default();
        let values = [0, 5, 10, 15];
        assert_eq!(cluster_positions(&values, Tolerance::Fixed(4.0), &config).len(), 4);
        assert_eq!(cluster_positions(&values, Tolerance::Auto, &config).len(), 1);
    }

    #[test]
    fn test_empty_and_single() {
        let config = GridConfig::default();
        assert!(cluster_positions(&[], Tolerance::Auto, &config).is_empty());
        assert_eq!(cluster_positions(&[7], Tolerance::Auto, &config), vec![7]);
        assert_eq!(median_gap(&[7]), None);
    }

    #[test]
    fn test_median_gap_even_count() {
        assert_eq!(median_gap(&[0, 2, 6, 12, 20]), Some(5.0));
        assert_eq!(median_gap(&[0, 2, 6]), Some(3.0));
    }

    #[test]
    fn test_repair_pass_merges_split_rows() {
        let config = GridConfig::default();
        // two detections per row, 12 px apart: the floor splits every row
        let ys: Vec<i32> = (0..45).flat_map(|i| [26 * i, 26 * i + 12]).collect();
        assert_eq!(cluster_positions(&ys, Tolerance::Auto, &config).len(), 90);

        let rows = infer_rows(&ys, &config);
        assert!(rows.repaired);
        assert_eq!(rows.positions.len(), 45);
        assert!(rows.in_band(&config));
    }

    #[test]
    fn test_no_repair_when_in_band() {
        let config = GridConfig::default();
        let ys: Vec<i32> = (0..45).map(|i| 80 + 26 * i).collect();
        let rows = infer_rows(&ys, &config);
        assert!(!rows.repaired);
        assert_eq!(rows.positions, ys);
    }

    #[test]
    fn test_repair_result_is_accepted() {
        let config = GridConfig::default();
        // a tolerance equal to the uniform gap merges all ten rows
        let ys: Vec<i32> = (0..10).map(|i| 30 * i).collect();
        let rows = infer_rows(&ys, &config);
        assert!(rows.repaired);
        assert_eq!(rows.positions, vec![135]);
    }

    #[test]
    fn test_prefer_closer_drops_repair_that_moves_away() {
        let config = GridConfig {
            row_repair: RowRepair::PreferCloser,
            ..GridConfig::default()
        };
        let ys: Vec<i32> = (0..10).map(|i| 30 * i).collect();
        let rows = infer_rows(&ys, &config);
        assert!(!rows.repaired);
        assert_eq!(rows.positions, ys);
        assert!(!rows.in_band(&config));
    }

    #[test]
    fn test_repair_is_kept_when_closer_to_band() {
        let config = GridConfig::default();
        // 70 rows split in two: the repair halves the count but stays over the band
        let ys: Vec<i32> = (0..70).flat_map(|i| [26 * i, 26 * i + 12]).collect();
        let rows = infer_rows(&ys, &config);
        assert!(rows.repaired);
        assert_eq!(rows.positions.len(), 70);
        assert!(!rows.in_band(&config));
    }

    #[test]
    fn test_ten_columns_split_into_two_blocks() {
        let config = GridConfig::default();
        let columns: Vec<i32> = (0..10).map(|i| 100 + 40 * i).collect();
        let (blocks, confidence) = interpret_columns(&columns, 1, &config);
        assert_eq!(confidence, Confidence::Normal);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].first_question, 1);
        assert_eq!(blocks[1].first_question, 46);
        assert_eq!(blocks[1].columns, vec![300, 340, 380, 420, 460]);
    }

    #[test]
    fn test_six_columns_is_one_block() {
        let config = GridConfig::default();
        let columns = [10, 50, 90, 130, 170, 210];
        let (blocks, confidence) = interpret_columns(&columns, 91, &config);
        assert_eq!(confidence, Confidence::Normal);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].first_question, 91);
        assert_eq!(blocks[0].columns.len(), 5);
    }

    #[test]
    fn test_few_columns_are_low_confidence() {
        let config = GridConfig::default();
        let (blocks, confidence) = interpret_columns(&[10, 50, 90], 1, &config);
        assert_eq!(confidence, Confidence::Low);
        assert_eq!(blocks[0].columns, vec![10, 50, 90]);
    }

    #[test]
    fn test_layout_cells_and_shape_error() {
        let config = GridConfig::default();
        let layout = GridLayout {
            rows: vec![10, 40],
            sub_blocks: vec![SubBlock {
                first_question: 1,
                columns: vec![5, 25],
            }],
            confidence: Confidence::Normal,
            repaired: false,
        };
        let cells = layout.cells(&layout.sub_blocks[0], 8);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[1][0].center, (5, 40));
        assert_eq!(cells[1][1].column, 1);
        assert!(matches!(
            layout.shape_error(&config),
            Some(SheetError::GridShapeMismatch { rows: 2, min: 40, max: 60 })
        ));
    }
}
