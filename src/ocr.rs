use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use opencv::core::Mat;

use crate::config::OcrConfig;
use crate::errors::OcrError;
use crate::image::encode_png;

/// One word box reported by the recognizer, in pixels of the image it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub confidence: f32,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

/// Anything that can turn an image into word boxes.
pub trait TextRecognizer {
    fn recognize_words(&self, image: &Mat) -> Result<Vec<RecognizedWord>, OcrError>;
}

/// Drives the `tesseract` command line tool.
///
/// The command is resolved once in [`OcrEngine::new`]; a missing binary is an
/// ordinary [`OcrError::NoTesseract`] the caller can recover from.
#[derive(Debug, Clone)]
pub struct OcrEngine {
    tesseract_cmd: PathBuf,
    tessdata_path: Option<PathBuf>,
    language: String,
}

impl OcrEngine {
    pub fn check_tesseract(cmd: &Path) -> Result<bool, OcrError> {
        let status = Command::new(cmd)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) => Ok(status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn new(config: &OcrConfig) -> Result<OcrEngine, OcrError> {
        if !OcrEngine::check_tesseract(&config.tesseract_cmd)? {
            return Err(OcrError::NoTesseract(
                config.tesseract_cmd.display().to_string(),
            ));
        }
        Ok(OcrEngine {
            tesseract_cmd: config.tesseract_cmd.clone(),
            tessdata_path: config.tessdata_dir.clone(),
            language: config.language.clone(),
        })
    }

    fn run_tsv(&self, png: &[u8]) -> Result<String, OcrError> {
        let mut command = Command::new(&self.tesseract_cmd);
        command
            .arg("stdin")
            .arg("stdout")
            .args(["-l", self.language.as_str()])
            .args(["--loglevel", "OFF"]);
        if let Some(tessdata) = &self.tessdata_path {
            command.args(["--tessdata-dir", tessdata.to_str().ok_or(OcrError::NoUnicode)?]);
        }
        let mut tesseract = command
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        {
            let mut stdin = tesseract
                .stdin
                .take()
                .ok_or_else(|| std::io::Error::other("tesseract stdin unavailable"))?;
            stdin.write_all(png)?;
        }

        let Output { stdout, .. } = tesseract.wait_with_output()?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }
}

impl TextRecognizer for OcrEngine {
    fn recognize_words(&self, image: &Mat) -> Result<Vec<RecognizedWord>, OcrError> {
        let png = encode_png(image)?;
        let tsv = self.run_tsv(&png)?;
        parse_tsv(&tsv)
    }
}

/// Parses tesseract's TSV output, keeping only non-empty word rows.
pub fn parse_tsv(tsv: &str) -> Result<Vec<RecognizedWord>, OcrError> {
    let mut words = Vec::new();
    for (idx, line) in tsv.lines().enumerate() {
        if idx == 0 && line.starts_with("level") {
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 11 {
            return Err(OcrError::MalformedOutput { line: idx + 1 });
        }
        let text = fields.get(11).map(|t| t.trim()).unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        let number = |i: usize| -> Result<i32, OcrError> {
            fields[i]
                .trim()
                .parse::<i32>()
                .map_err(|_| OcrError::MalformedOutput { line: idx + 1 })
        };
        let confidence = fields[10]
            .trim()
            .parse::<f32>()
            .map_err(|_| OcrError::MalformedOutput { line: idx + 1 })?;
        words.push(RecognizedWord {
            text: text.to_string(),
            confidence,
            left: number(6)?,
            top: number(7)?,
            width: number(8)?,
            height: number(9)?,
        });
    }
    Ok(words)
}

/// Lower-cases `token` and folds Latin diacritics, so "ASSINATURA" and
/// "Assinatúra" compare equal.
///
/// Covers the Latin-1 Supplement and the common Latin Extended-A letters, plus
/// any combining mark in U+0300..U+036F. Other scripts pass through unchanged.
pub fn normalize_token(token: &str) -> String {
    let mut folded = String::with_capacity(token.len());
    for c in token.to_lowercase().chars() {
        if ('\u{0300}'..='\u{036f}').contains(&c) {
            continue;
        }
        match fold_letter(c) {
            Some(ascii) => folded.push_str(ascii),
            None => folded.push(c),
        }
    }
    folded
}

fn fold_letter(c: char) -> Option<&'static str> {
    let ascii = match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => "c",
        'ď' | 'đ' | 'ð' => "d",
        'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => "e",
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => "g",
        'ĥ' | 'ħ' => "h",
        'í' | 'ì' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => "i",
        'ĵ' => "j",
        'ķ' => "k",
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => "l",
        'ñ' | 'ń' | 'ņ' | 'ň' => "n",
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => "o",
        'œ' => "oe",
        'ŕ' | 'ŗ' | 'ř' => "r",
        'ś' | 'ŝ' | 'ş' | 'š' => "s",
        'ß' => "ss",
        'ţ' | 'ť' | 'ŧ' => "t",
        'þ' => "th",
        'ú' | 'ù' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => "u",
        'ŵ' => "w",
        'ý' | 'ÿ' | 'ŷ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    };
    Some(ascii)
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t1285\t1817\t-1\t
5\t1\t1\t1\t1\t1\t108\t92\t140\t22\t91.5\tAssinatura
5\t1\t1\t1\t1\t2\t260\t92\t30\t22\t12\tdo
5\t1\t1\t1\t1\t3\t300\t92\t80\t22\t-1\t
";

    #[test]
    fn test_parse_tsv_keeps_words_only() {
        let words = parse_tsv(SAMPLE_TSV).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Assinatura");
        assert_eq!((words[0].left, words[0].top), (108, 92));
        assert_eq!(words[0].confidence, 91.5);
        assert_eq!(words[1].confidence, 12.0);
    }

    #[test]
    fn test_parse_tsv_rejects_short_rows() {
        let result = parse_tsv("level\tpage_num\n5\t1\t1\n");
        assert!(matches!(result, Err(OcrError::MalformedOutput { line: 2 })));
    }

    #[test]
    fn test_normalize_token_folds_case_and_accents() {
        assert_eq!(normalize_token("ASSINATÚRA"), "assinatura");
        assert_eq!(normalize_token("Questão"), "questao");
        assert_eq!(normalize_token("Simulado"), "simulado");
        // decomposed form: "e" + combining acute
        assert_eq!(normalize_token("Cafe\u{0301}"), "cafe");
    }

    #[test]
    fn test_normalize_token_folds_extended_latin() {
        assert_eq!(normalize_token("Ørsted"), "orsted");
        assert_eq!(normalize_token("Erdős"), "erdos");
        assert_eq!(normalize_token("Świętokrzyskie"), "swietokrzyskie");
        assert_eq!(normalize_token("STRAẞE"), "strasse");
        assert_eq!(normalize_token("Ελλάδα"), "ελλάδα");
    }

    #[test]
    fn test_missing_binary_is_catchable() {
        let config = OcrConfig {
            tesseract_cmd: PathBuf::from("/nonexistent/definitely-not-tesseract"),
            ..OcrConfig::default()
        };
        let result = OcrEngine::new(&config);
        assert!(matches!(result, Err(OcrError::NoTesseract(_))));
    }

    #[cfg(feature = "ocr-tests")]
    #[test]
    fn test_real_tesseract_reads_blank_page() {
        use opencv::core::{Scalar, CV_8UC1};
        use opencv::prelude::*;
        let engine = OcrEngine::new(&OcrConfig::default()).unwrap();
        let blank = Mat::new_rows_cols_with_default(200, 400, CV_8UC1, Scalar::all(255.0)).unwrap();
        let words = engine.recognize_words(&blank).unwrap();
        assert!(words.is_empty());
    }
}
