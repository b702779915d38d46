//! Result aggregation and threshold flagging.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use triage_core::{AnalyzerResult, ErrorKind, Finding, TaskId};

/// Per-kind statistics over a set of findings.
///
/// [`FindingSummary::merge`] is associative and commutative, so summaries of
/// fan-out results can be combined in any order as they arrive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindingSummary {
    /// Results folded into this summary
    pub tasks: u64,
    /// Result count per status
    pub statuses: BTreeMap<String, u64>,
    /// Finding count per kind
    pub counts: BTreeMap<String, u64>,
    /// Highest score per kind
    pub max_scores: BTreeMap<String, f64>,
}

impl FindingSummary {
    /// Summarise loose findings.
    pub fn from_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut summary = Self::default();
        for finding in findings {
            summary.add_finding(finding);
        }
        summary
    }

    /// Summarise one result.
    pub fn from_result(result: &AnalyzerResult) -> Self {
        let mut summary = Self::from_findings(&result.findings);
        summary.tasks = 1;
        summary.statuses.insert(result.status.to_string(), 1);
        summary
    }

    fn add_finding(&mut self, finding: &Finding) {
        let kind = finding.kind().as_str();
        *self.counts.entry(kind.to_string()).or_insert(0) += 1;
        if let Some(score) = finding.score().filter(|s| !s.is_nan()) {
            self.max_scores
                .entry(kind.to_string())
                .and_modify(|max| *max = max.max(score))
                .or_insert(score);
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &FindingSummary) {
        self.tasks += other.tasks;
        for (status, n) in &other.statuses {
            *self.statuses.entry(status.clone()).or_insert(0) += n;
        }
        for (kind, n) in &other.counts {
            *self.counts.entry(kind.clone()).or_insert(0) += n;
        }
        for (kind, score) in &other.max_scores {
            self.max_scores
                .entry(kind.clone())
                .and_modify(|max| *max = max.max(*score))
                .or_insert(*score);
        }
    }

    /// Merged copy.
    pub fn merged(mut self, other: &FindingSummary) -> Self {
        self.merge(other);
        self
    }

    /// Findings of all kinds.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Findings of one kind.
    pub fn count(&self, kind: &str) -> u64 {
        self.counts.get(kind).copied().unwrap_or(0)
    }
}

/// Rules deciding whether a summary is worth a human's attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryRules {
    /// Flag when the highest score of a kind exceeds the value
    pub score_thresholds: BTreeMap<String, f64>,
    /// Flag when a kind has more findings than the value
    pub max_per_kind: BTreeMap<String, u64>,
    /// Flag on any finding of these kinds
    pub flag_kinds: BTreeSet<String>,
}

impl Default for SummaryRules {
    fn default() -> Self {
        Self {
            score_thresholds: BTreeMap::new(),
            max_per_kind: BTreeMap::new(),
            flag_kinds: BTreeSet::from(["entropy-flag".to_string()]),
        }
    }
}

impl SummaryRules {
    /// Reasons `summary` is flagged, sorted. Empty means not flagged.
    pub fn evaluate(&self, summary: &FindingSummary) -> Vec<String> {
        let mut reasons = Vec::new();

        for kind in &self.flag_kinds {
            let n = summary.count(kind);
            if n > 0 {
                reasons.push(format!("{}: {} finding(s)", kind, n));
            }
        }
        for (kind, threshold) in &self.score_thresholds {
            if let Some(score) = summary.max_scores.get(kind) {
                if score > threshold {
                    reasons.push(format!("{}: score {:.3} above {}", kind, score, threshold));
                }
            }
        }
        for (kind, limit) in &self.max_per_kind {
            let n = summary.count(kind);
            if n > *limit {
                reasons.push(format!("{}: {} findings exceed limit {}", kind, n, limit));
            }
        }

        reasons.sort();
        reasons.dedup();
        reasons
    }
}

/// Report for one envelope, as handed to a report sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// The terminal result
    pub result: AnalyzerResult,
    /// Summary of its findings
    pub summary: FindingSummary,
    /// Whether any rule matched
    pub flagged: bool,
    /// Matched rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// The envelope was refused at admission; the result was not stored
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejected: bool,
}

impl TaskReport {
    /// Task the report is about.
    pub fn task_id(&self) -> TaskId {
        self.result.task_id
    }
}

/// Combined view over several results of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Tasks included so far
    pub task_ids: Vec<TaskId>,
    /// Merged summary
    pub summary: FindingSummary,
    /// Whether any rule matched
    pub flagged: bool,
    /// Matched rules
    pub reasons: Vec<String>,
}

/// Applies [`SummaryRules`] to results.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    rules: SummaryRules,
}

impl Aggregator {
    /// Create with rules.
    pub fn new(rules: SummaryRules) -> Self {
        Self { rules }
    }

    /// The rules in use.
    pub fn rules(&self) -> &SummaryRules {
        &self.rules
    }

    /// Report for a terminal result.
    pub fn report(&self, result: AnalyzerResult) -> TaskReport {
        let summary = FindingSummary::from_result(&result);
        let reasons = self.rules.evaluate(&summary);
        TaskReport {
            result,
            summary,
            flagged: !reasons.is_empty(),
            reasons,
            rejected: false,
        }
    }

    /// Report for an envelope refused at admission.
    pub fn rejected(
        &self,
        task_id: TaskId,
        analyzer: &str,
        kind: ErrorKind,
        message: impl std::fmt::Display,
    ) -> TaskReport {
        let mut report = self.report(AnalyzerResult::errored(task_id, analyzer, kind, message));
        report.rejected = true;
        report
    }

    /// Merge whichever results of a fan-out are available.
    pub fn merge_results<'a>(
        &self,
        results: impl IntoIterator<Item = &'a AnalyzerResult>,
    ) -> AggregateReport {
        let mut task_ids = Vec::new();
        let mut summary = FindingSummary::default();
        for result in results {
            task_ids.push(result.task_id);
            summary.merge(&FindingSummary::from_result(result));
        }
        task_ids.sort();

        let reasons = self.rules.evaluate(&summary);
        AggregateReport {
            task_ids,
            summary,
            flagged: !reasons.is_empty(),
            reasons,
        }
    }
}
