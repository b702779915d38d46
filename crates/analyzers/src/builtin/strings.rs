//! Printable string extraction, in the style of `strings -a -t d`.

use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use triage_core::{Finding, FindingKind, Location, PendingArtifact};

use super::{read_artifact, run_blocking};
use crate::options::{OptionKind, OptionSpec, OptionsExt};
use crate::r#trait::{AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput};

const DEFAULT_MIN_LENGTH: u64 = 4;

/// Character encoding to scan for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringsEncoding {
    /// Single-byte printable characters
    Ascii,
    /// Printable characters stored as little-endian UTF-16 code units
    Utf16Le,
}

impl StringsEncoding {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ascii" => Some(StringsEncoding::Ascii),
            "utf16le" => Some(StringsEncoding::Utf16Le),
            _ => None,
        }
    }

    /// Suffix used for the output file, matching `strings --encoding`.
    fn suffix(self) -> &'static str {
        match self {
            StringsEncoding::Ascii => "s",
            StringsEncoding::Utf16Le => "l",
        }
    }
}

fn is_printable(b: u8) -> bool {
    b == b'\t' || (0x20..=0x7e).contains(&b)
}

/// Extract `(offset, text)` pairs of at least `min_length` characters.
pub fn extract_strings(data: &[u8], encoding: StringsEncoding, min_length: usize) -> Vec<(u64, String)> {
    let min_length = min_length.max(1);
    let step = match encoding {
        StringsEncoding::Ascii => 1,
        StringsEncoding::Utf16Le => 2,
    };

    let mut out = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;
    let flush = |current: &mut String, start: usize, out: &mut Vec<(u64, String)>| {
        if current.len() >= min_length {
            out.push((start as u64, std::mem::take(current)));
        } else {
            current.clear();
        }
    };

    let mut i = 0usize;
    while i + step <= data.len() {
        let ch = match encoding {
            StringsEncoding::Ascii => Some(data[i]).filter(|&b| is_printable(b)),
            StringsEncoding::Utf16Le => Some(data[i]).filter(|&b| is_printable(b) && data[i + 1] == 0),
        };
        match ch {
            Some(b) => {
                if current.is_empty() {
                    start = i;
                }
                current.push(b as char);
                i += step;
            }
            None => {
                flush(&mut current, start, &mut out);
                // Resynchronise byte by byte so odd-aligned UTF-16 is found.
                i += 1;
            }
        }
    }
    flush(&mut current, start, &mut out);
    out
}

/// Extracts printable strings into one text artifact per input and encoding.
pub struct StringsAnalyzer;

#[async_trait]
impl Analyzer for StringsAnalyzer {
    fn name(&self) -> &str {
        "strings"
    }

    fn descriptor(&self) -> AnalyzerDescriptor {
        AnalyzerDescriptor {
            name: "strings".to_string(),
            class: "strings".to_string(),
            description: "Extract printable strings with decimal offsets".to_string(),
            options: vec![
                OptionSpec::new(
                    "encoding",
                    OptionKind::ChoiceSet(vec!["ascii".to_string(), "utf16le".to_string()]),
                    "Character encoding to scan for, or a list of them",
                )
                .default_value("ascii"),
                OptionSpec::new("min_length", OptionKind::Integer, "Minimum string length")
                    .default_value(DEFAULT_MIN_LENGTH),
            ],
            deterministic: true,
        }
    }

    async fn run(
        &self,
        input: &AnalysisInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        let mut encodings = Vec::new();
        for name in input.options.str_list_opt("encoding") {
            let encoding = StringsEncoding::parse(name)
                .ok_or_else(|| AnalyzerError::Input(format!("{} is not a valid encoding", name)))?;
            encodings.push((name, encoding));
        }
        if encodings.is_empty() {
            encodings.push(("ascii", StringsEncoding::Ascii));
        }
        let min_length = input.options.u64_opt("min_length").unwrap_or(DEFAULT_MIN_LENGTH) as usize;

        let started = Instant::now();
        let mut extracted = 0usize;
        let mut output = AnalyzerOutput::default();
        for (done, artifact) in input.artifacts.iter().enumerate() {
            let data = Arc::new(read_artifact(artifact, cancel).await?);

            for &(encoding_name, encoding) in &encodings {
                let bytes = data.clone();
                let strings =
                    run_blocking(cancel, move || extract_strings(&bytes, encoding, min_length)).await?;
                extracted += strings.len();

                output.findings.push(
                    Finding::new(FindingKind::Strings, Location::Whole)
                        .in_artifact(artifact.id())
                        .with_payload(json!({
                            "count": strings.len(),
                            "encoding": encoding_name,
                        })),
                );

                if strings.is_empty() {
                    continue;
                }

                let mut text = String::new();
                for (offset, s) in &strings {
                    let _ = writeln!(text, "{} {}", offset, s);
                }
                output.artifacts.push(PendingArtifact::new(
                    format!("{}.{}_strings", artifact.name(), encoding.suffix()),
                    text.into_bytes(),
                ));
            }

            let elapsed = started.elapsed().as_secs_f64();
            input.progress.report(json!({
                "extracted_strings": extracted,
                "artifacts_done": done + 1,
                "artifacts_total": input.artifacts.len(),
                "rate": if elapsed > 0.0 { extracted as f64 / elapsed } else { 0.0 },
            }));
        }

        Ok(output)
    }
}
