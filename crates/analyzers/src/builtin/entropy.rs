//! Shannon entropy measurement.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use triage_core::{Finding, FindingKind, Location};

use super::{read_artifact, run_blocking};
use crate::options::{OptionKind, OptionSpec, OptionsExt};
use crate::r#trait::{AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput};

/// Shannon entropy of `data` in bits per byte (0.0 ..= 8.0).
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }

    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Measures entropy per artifact. High entropy suggests compressed or
/// encrypted content.
pub struct EntropyAnalyzer;

#[async_trait]
impl Analyzer for EntropyAnalyzer {
    fn name(&self) -> &str {
        "entropy"
    }

    fn descriptor(&self) -> AnalyzerDescriptor {
        AnalyzerDescriptor {
            name: "entropy".to_string(),
            class: "entropy".to_string(),
            description: "Shannon entropy in bits per byte".to_string(),
            options: vec![
                OptionSpec::new(
                    "entropy_threshold",
                    OptionKind::Float,
                    "Emit entropy-flag findings above this value",
                ),
                OptionSpec::new(
                    "block_size",
                    OptionKind::PositiveInteger,
                    "Also measure fixed-size blocks of this many bytes",
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
        let threshold = input.options.f64_opt("entropy_threshold");
        let block_size = match input.options.u64_opt("block_size") {
            Some(0) => return Err(AnalyzerError::Input("block_size must be positive".to_string())),
            other => other.map(|b| b as usize),
        };
        let kind_for = move |entropy: f64| match threshold {
            Some(t) if entropy > t => FindingKind::EntropyFlag,
            _ => FindingKind::Entropy,
        };

        let mut findings = Vec::new();
        for artifact in &input.artifacts {
            let data = read_artifact(artifact, cancel).await?;
            let size = data.len() as u64;
            let (whole, blocks) = run_blocking(cancel, move || {
                let whole = shannon_entropy(&data);
                let blocks: Vec<(u64, u64, f64)> = match block_size {
                    Some(bs) => data
                        .chunks(bs)
                        .enumerate()
                        .map(|(i, chunk)| {
                            let start = (i * bs) as u64;
                            (start, start + chunk.len() as u64, shannon_entropy(chunk))
                        })
                        .collect(),
                    None => Vec::new(),
                };
                (whole, blocks)
            })
            .await?;

            tracing::debug!(artifact = %artifact.name(), entropy = whole, "entropy measured");
            findings.push(
                Finding::new(kind_for(whole), Location::Whole)
                    .in_artifact(artifact.id())
                    .with_score(whole)
                    .with_payload(json!({ "size": size, "threshold": threshold })),
            );

            for (start, end, entropy) in blocks {
                let kind = kind_for(entropy);
                // With a threshold only the blocks above it are interesting.
                if threshold.is_some() && kind != FindingKind::EntropyFlag {
                    continue;
                }
                findings.push(
                    Finding::new(kind, Location::Range { start, end })
                        .in_artifact(artifact.id())
                        .with_score(entropy),
                );
            }
        }

        Ok(AnalyzerOutput::findings(findings))
    }
}
