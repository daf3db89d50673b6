use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// All tunables of the reading pipeline.
///
/// Every section falls back to its `Default`, so a TOML file only has to name what
/// it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OmrConfig {
    pub raster: RasterConfig,
    pub anchors: AnchorChainConfig,
    pub markers: MarkerConfig,
    pub perspective: PerspectiveConfig,
    pub bubbles: DetectorConfig,
    pub grid: GridConfig,
    pub fill: FillConfig,
    pub text_anchor: TextAnchorConfig,
    pub template: TemplateConfig,
    pub identifier: IdentifierConfig,
    pub ocr: OcrConfig,
    pub pages: PageConfig,
    pub reference: ReferenceConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl OmrConfig {
    pub fn from_toml_str(text: &str) -> Result<OmrConfig, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<OmrConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        OmrConfig::from_toml_str(&text)
    }

    /// Reads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<OmrConfig, ConfigError> {
        match path {
            Some(path) => {
                log::info!("loading config from {}", path.display());
                OmrConfig::from_file(path)
            }
            None => Ok(OmrConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterConfig {
    /// Every input is rescaled to this width before anything else runs.
    /// `0` keeps the native size.
    pub working_width: i32,
}

impl Default for RasterConfig {
    fn default() -> Self {
        RasterConfig {
            working_width: 1285,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStrategyKind {
    Markers,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorChainConfig {
    /// Strategies in the order they are tried.
    pub strategies: Vec<AnchorStrategyKind>,
}

impl Default for AnchorChainConfig {
    fn default() -> Self {
        AnchorChainConfig {
            strategies: vec![AnchorStrategyKind::Markers, AnchorStrategyKind::Text],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub min_area: f64,
    pub max_area: f64,
    pub min_aspect: f64,
    pub max_aspect: f64,
    /// `approx_poly_dp` epsilon as a fraction of the contour perimeter.
    pub epsilon_frac: f64,
    pub close_kernel: i32,
    /// The four outermost markers must enclose at least this fraction of the
    /// image area.
    pub min_frame_area_frac: f64,
    /// Smallest `|sin|` allowed at any frame corner; rejects near-collinear
    /// triples.
    pub min_corner_sine: f64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        MarkerConfig {
            min_area: 200.0,
            max_area: 8000.0,
            min_aspect: 0.7,
            max_aspect: 1.3,
            epsilon_frac: 0.02,
            close_kernel: 3,
            min_frame_area_frac: 0.25,
            min_corner_sine: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerspectiveConfig {
    pub margin: f64,
    pub min_width: i32,
    pub min_height: i32,
}

impl Default for PerspectiveConfig {
    fn default() -> Self {
        PerspectiveConfig {
            margin: 1.05,
            min_width: 1000,
            min_height: 1200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub blur_kernel: i32,
    pub block_size: i32,
    pub c: f64,
    /// Side of the elliptical opening kernel, `0` skips the opening.
    pub open_kernel: i32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            blur_kernel: 5,
            block_size: 15,
            c: 4.0,
            open_kernel: 3,
        }
    }
}

/// Accepted bubble shapes. Sizes are `max(px, frac * region width)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BubbleFilter {
    pub min_size_frac: f64,
    pub max_size_frac: f64,
    pub min_size_px: i32,
    pub max_size_px: i32,
    pub min_aspect: f64,
    pub max_aspect: f64,
    pub min_area: f64,
}

impl Default for BubbleFilter {
    fn default() -> Self {
        BubbleFilter {
            min_size_frac: 0.012,
            max_size_frac: 0.045,
            min_size_px: 6,
            max_size_px: 20,
            min_aspect: 0.7,
            max_aspect: 1.3,
            min_area: 20.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub preprocess: PreprocessConfig,
    pub filter: BubbleFilter,
}

/// What the single row-repair pass does with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRepair {
    /// The repaired clustering replaces the first one.
    #[default]
    Accept,
    /// The repaired clustering is dropped when it lands further from the
    /// plausible row band than the first one.
    PreferCloser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub tolerance_floor: f64,
    pub tolerance_factor: f64,
    pub min_rows: usize,
    pub max_rows: usize,
    pub alternatives: usize,
    /// Questions between the first and the second side-by-side sub-block.
    pub second_block_offset: u32,
    pub row_repair: RowRepair,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            tolerance_floor: 10.0,
            tolerance_factor: 1.0 / 3.0,
            min_rows: 40,
            max_rows: 60,
            alternatives: 5,
            second_block_offset: 45,
            row_repair: RowRepair::Accept,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillConfig {
    /// Minimum coverage fraction for a row winner to count as marked.
    pub threshold: f64,
    /// Mask radius as a fraction of the mean candidate width. The candidate box
    /// includes the printed ring, so this keeps the mask inside it.
    pub radius_factor: f64,
    pub min_radius: i32,
}

impl Default for FillConfig {
    fn default() -> Self {
        FillConfig {
            threshold: 0.20,
            radius_factor: 0.3,
            min_radius: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextAnchorConfig {
    pub keyword: String,
    pub fallback_keyword: String,
    /// Added to the fallback token's corner so it lands where the primary would be.
    pub fallback_offset: (i32, i32),
    pub min_confidence: f32,
}

impl Default for TextAnchorConfig {
    fn default() -> Self {
        TextAnchorConfig {
            keyword: "assinatur".to_string(),
            fallback_keyword: "simulado".to_string(),
            fallback_offset: (-280, 10),
            min_confidence: 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionKind {
    Answers { first_question: u32 },
    Identifier,
}

/// A region in template units, relative to the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemplateRegion {
    #[serde(flatten)]
    pub kind: RegionKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub reference_width: f64,
    pub reference_height: f64,
    pub regions: Vec<TemplateRegion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Regions hanging off a single text anchor.
    pub anchored: Template,
    /// Regions in the rectified frame, anchored at its top-left corner.
    ///
    /// The default is one answer region over the whole frame and no identifier
    /// region, since marker layouts place the identifier grid differently. A
    /// marker-framed sheet only yields an identifier once a `kind = "identifier"`
    /// region is configured here.
    pub canonical: Template,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            anchored: Template {
                reference_width: 1285.0,
                reference_height: 1817.0,
                regions: vec![
                    TemplateRegion {
                        kind: RegionKind::Identifier,
                        x: 7.0,
                        y: 188.0,
                        width: 100.0,
                        height: 270.0,
                    },
                    TemplateRegion {
                        kind: RegionKind::Answers { first_question: 1 },
                        x: 162.0,
                        y: 178.0,
                        width: 560.0,
                        height: 595.0,
                    },
                ],
            },
            canonical: Template {
                reference_width: 1000.0,
                reference_height: 1200.0,
                regions: vec![TemplateRegion {
                    kind: RegionKind::Answers { first_question: 1 },
                    x: 0.0,
                    y: 0.0,
                    width: 1000.0,
                    height: 1200.0,
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    pub columns: usize,
    pub rows: usize,
    pub detector: DetectorConfig,
    /// Bubbles whose left edges are closer than this fraction of the region
    /// width share a column.
    pub column_distance_frac: f64,
    pub radius_factor: f64,
    pub placeholder: char,
    pub min_readable_digits: usize,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        IdentifierConfig {
            columns: 2,
            rows: 10,
            detector: DetectorConfig {
                preprocess: PreprocessConfig {
                    open_kernel: 0,
                    ..PreprocessConfig::default()
                },
                filter: BubbleFilter {
                    min_size_frac: 0.10,
                    max_size_frac: 0.35,
                    min_size_px: 4,
                    max_size_px: 12,
                    min_aspect: 0.8,
                    max_aspect: 1.2,
                    min_area: 10.0,
                },
            },
            column_distance_frac: 0.13,
            radius_factor: 0.4,
            placeholder: '?',
            min_readable_digits: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub tesseract_cmd: PathBuf,
    pub tessdata_dir: Option<PathBuf>,
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        OcrConfig {
            tesseract_cmd: PathBuf::from("tesseract"),
            tessdata_dir: None,
            language: "por".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub question_offset_per_page: u32,
}

impl Default for PageConfig {
    fn default() -> Self {
        PageConfig {
            question_offset_per_page: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub base_url: String,
    pub default_question_count: u32,
    pub max_concurrent_requests: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            base_url: "https://api.enem.dev/v1".to_string(),
            default_question_count: 180,
            max_concurrent_requests: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub output_dir: Option<PathBuf>,
}
