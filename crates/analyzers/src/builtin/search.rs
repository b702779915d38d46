//! Regex search over artifact bytes.

use async_trait::async_trait;
use regex::bytes::RegexBuilder;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use triage_core::{Finding, FindingKind, Location};

use super::{read_artifact, run_blocking};
use crate::options::{OptionKind, OptionSpec, OptionsExt};
use crate::r#trait::{AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput};

/// Grep-style search. One `match` finding per occurrence, located at the
/// byte offset where the match starts.
pub struct SearchAnalyzer;

#[async_trait]
impl Analyzer for SearchAnalyzer {
    fn name(&self) -> &str {
        "search"
    }

    fn descriptor(&self) -> AnalyzerDescriptor {
        AnalyzerDescriptor {
            name: "search".to_string(),
            class: "search".to_string(),
            description: "Search artifact bytes for a regular expression".to_string(),
            options: vec![
                OptionSpec::new("pattern", OptionKind::Regex, "Pattern to search for").required(),
                OptionSpec::new("case_sensitive", OptionKind::Bool, "Match case exactly")
                    .default_value(true),
                OptionSpec::new("literal", OptionKind::Bool, "Treat the pattern as plain text")
                    .default_value(false),
                OptionSpec::new(
                    "max_matches",
                    OptionKind::Integer,
                    "Stop after this many matches per artifact",
                ),
            ],
            deterministic: true,
        }
    }

    async fn run(
        &self,
        input: &AnalysisInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        let pattern = input
            .options
            .str_opt("pattern")
            .ok_or_else(|| AnalyzerError::Input("missing option 'pattern'".to_string()))?;
        let pattern = if input.options.bool_opt("literal", false) {
            regex::escape(pattern)
        } else {
            pattern.to_string()
        };
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(!input.options.bool_opt("case_sensitive", true))
            .build()
            .map_err(|e| AnalyzerError::Input(format!("invalid pattern: {}", e)))?;
        let limit = input
            .options
            .u64_opt("max_matches")
            .map(|m| m as usize)
            .unwrap_or(usize::MAX);

        let mut findings = Vec::new();
        for artifact in &input.artifacts {
            let data = read_artifact(artifact, cancel).await?;
            let regex = regex.clone();
            let matches = run_blocking(cancel, move || {
                regex
                    .find_iter(&data)
                    .take(limit)
                    .map(|m| (m.start() as u64, String::from_utf8_lossy(m.as_bytes()).into_owned()))
                    .collect::<Vec<_>>()
            })
            .await?;

            tracing::debug!(artifact = %artifact.name(), matches = matches.len(), "search complete");
            findings.extend(matches.into_iter().map(|(offset, matched)| {
                Finding::new(FindingKind::Match, Location::Offset { offset })
                    .in_artifact(artifact.id())
                    .with_payload(json!({
                        "length": matched.len(),
                        "matched": matched,
                    }))
            }));
        }

        Ok(AnalyzerOutput::findings(findings))
    }
}
