use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use omrscore_lib::anchor::{BoxedStrategy, MarkerAnchorStrategy};
use omrscore_lib::diagnostics::DiagnosticMode;
use omrscore_lib::errors::OcrError;
use omrscore_lib::reference::{correct_batch, EnemApiClient};
use omrscore_lib::storage::{
    export_answers_csv, export_correction_csv, HistoryEntry, JsonFileRegistry, RespondentRegistry,
};
use omrscore_lib::{Answer, CorrectionResult, IdentifierCode, OmrConfig, SheetReader, SheetReport};

/// Read bubbled answer sheets and score them against the official key
#[derive(Parser, Debug)]
#[command(name = "omrscore")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration; defaults are used for anything it leaves out
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read answer sheet images into JSON reports
    Scan {
        /// Sheet images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Treat the images as consecutive pages of one sheet
        #[arg(long)]
        pages: bool,

        /// Output JSON file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Directory for one `question,answer` CSV per sheet
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Directory for annotated stage images
        #[arg(long)]
        debug_dir: Option<PathBuf>,
    },
    /// Correct scanned reports against the reference answer key
    Correct {
        /// JSON written by `scan`
        #[arg(short, long)]
        report: PathBuf,

        /// Exam year
        #[arg(short, long)]
        year: u32,

        /// Exam day (1 or 2)
        #[arg(short, long, default_value = "1")]
        day: u8,

        /// Foreign-language option of the exam
        #[arg(short, long)]
        language: Option<String>,

        /// JSON registry to append each respondent's history to
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Directory for one correction CSV per sheet
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Output JSON file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReportFile {
    Many(Vec<SheetReport>),
    One(SheetReport),
}

#[derive(Serialize)]
struct SheetCorrection {
    source: String,
    identifier: Option<IdentifierCode>,
    result: CorrectionResult,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = OmrConfig::load(args.config.as_deref()).context("cannot load configuration")?;

    match args.command {
        Command::Scan {
            images,
            pages,
            out,
            csv,
            debug_dir,
        } => {
            let mut reader = reader_for(config)?;
            if let Some(dir) = debug_dir {
                reader = reader.with_diagnostics(DiagnosticMode::Directory(dir));
            }
            let reports = if pages {
                vec![reader.read_pages(&images)]
            } else {
                reader.process_batch(&images)
            };
            for report in &reports {
                log::info!(
                    "{}: {:?}, {} failure(s)",
                    report.source,
                    report.outcome,
                    report.failures.len()
                );
            }
            if let Some(dir) = csv {
                std::fs::create_dir_all(&dir)?;
                for report in &reports {
                    if let Some(answers) = &report.answers {
                        let path = dir.join(format!("{}.csv", file_stem(&report.source)));
                        export_answers_csv(answers, &path)
                            .with_context(|| format!("cannot write {}", path.display()))?;
                    }
                }
            }
            write_json(&reports, out.as_deref())
        }
        Command::Correct {
            report,
            year,
            day,
            language,
            registry,
            csv,
            out,
        } => {
            let text = std::fs::read_to_string(&report)
                .with_context(|| format!("cannot read {}", report.display()))?;
            let reports = match serde_json::from_str::<ReportFile>(&text)
                .with_context(|| format!("{} is not a scan report", report.display()))?
            {
                ReportFile::Many(reports) => reports,
                ReportFile::One(report) => vec![report],
            };

            let (readable, unreadable): (Vec<SheetReport>, Vec<SheetReport>) =
                reports.into_iter().partition(|r| r.answers.is_some());
            for report in &unreadable {
                log::warn!("{}: no answers to correct", report.source);
            }

            let client = EnemApiClient::new(&config.reference);
            let runtime = tokio::runtime::Runtime::new()?;
            let sheets: Vec<&[Answer]> = readable
                .iter()
                .filter_map(|report| report.answers.as_deref())
                .collect();
            let results = runtime.block_on(correct_batch(
                &client,
                &sheets,
                year,
                day,
                language.as_deref(),
            ));

            let mut registry = registry.map(JsonFileRegistry::open).transpose()?;
            let mut corrections = Vec::new();
            for (report, result) in readable.into_iter().zip(results) {
                if let (Some(registry), Some(code)) = (registry.as_mut(), &report.identifier) {
                    registry.append(code, HistoryEntry::now(year, day, language.clone(), &result))?;
                }
                if let Some(dir) = &csv {
                    std::fs::create_dir_all(dir)?;
                    let path = dir.join(format!("{}_correction.csv", file_stem(&report.source)));
                    export_correction_csv(&result, &path)
                        .with_context(|| format!("cannot write {}", path.display()))?;
                }
                corrections.push(SheetCorrection {
                    source: report.source,
                    identifier: report.identifier,
                    result,
                });
            }
            write_json(&corrections, out.as_deref())
        }
    }
}

/// Text anchors need tesseract; without it the sheets are read from their
/// printed markers alone.
fn reader_for(config: OmrConfig) -> anyhow::Result<SheetReader> {
    match SheetReader::new(config.clone()) {
        Ok(reader) => Ok(reader),
        Err(e @ OcrError::NoTesseract(_)) => {
            log::warn!("{e} Continuing with printed markers only.");
            let strategies: Vec<BoxedStrategy> =
                vec![Box::new(MarkerAnchorStrategy::new(config.markers.clone()))];
            Ok(SheetReader::with_strategies(config, strategies))
        }
        Err(e) => Err(e).context("cannot start the text recognizer"),
    }
}

fn file_stem(source: &str) -> String {
    Path::new(source)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sheet".to_string())
}

fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), value)?;
            log::info!("results saved to {}", path.display());
        }
        None => {
            serde_json::to_writer_pretty(std::io::stdout().lock(), value)?;
            println!();
        }
    }
    Ok(())
}
