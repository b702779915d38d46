//! External tool analyzer.
//!
//! Wraps a command line tool (grep, PhotoRec, YARA, ...) described by a
//! [`CommandSpec`]. The child is spawned with `kill_on_drop`, so dropping the
//! run future (cancellation or engine abort) also kills the process, and the
//! scratch output directory is a `TempDir` removed on every exit path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use triage_core::{AnalyzerOptions, ArtifactRef, Finding, FindingKind, Location, PendingArtifact};

use crate::options::OptionSpec;
use crate::r#trait::{AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput};

/// How to read the tool's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// Every non-empty line is one finding located at the input path
    #[default]
    Plain,
    /// `offset:text` lines, as printed by `grep -b -o`
    Offset,
}

/// Declarative description of an external tool.
///
/// `args` may contain `{input}` (input file path), `{output_dir}` (scratch
/// directory) and `{opt:NAME}` (value of a declared option).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Analyzer name
    pub name: String,

    /// Resource class
    pub class: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Executable
    pub program: String,

    /// Argument templates
    #[serde(default)]
    pub args: Vec<String>,

    /// Options the tool accepts
    #[serde(default)]
    pub options: Vec<OptionSpec>,

    /// Kind of the findings parsed from stdout
    #[serde(default = "default_finding_kind")]
    pub finding_kind: String,

    /// Stdout format
    #[serde(default)]
    pub line_format: LineFormat,

    /// Exit codes that mean success
    #[serde(default = "default_ok_exit_codes")]
    pub ok_exit_codes: Vec<i32>,

    /// Exit codes worth retrying
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,

    /// Turn files written to `{output_dir}` into output artifacts
    #[serde(default)]
    pub collect_outputs: bool,
}

fn default_finding_kind() -> String {
    "match".to_string()
}

fn default_ok_exit_codes() -> Vec<i32> {
    vec![0]
}

impl CommandSpec {
    /// Minimal spec for `program args...`.
    pub fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            description: String::new(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            options: Vec::new(),
            finding_kind: default_finding_kind(),
            line_format: LineFormat::Plain,
            ok_exit_codes: default_ok_exit_codes(),
            transient_exit_codes: Vec::new(),
            collect_outputs: false,
        }
    }
}

/// Analyzer running one external process per input artifact.
pub struct CommandAnalyzer {
    spec: CommandSpec,
}

impl CommandAnalyzer {
    /// Create from a spec.
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    fn render_args(&self, input: &Path, output_dir: &Path, options: &AnalyzerOptions) -> Vec<String> {
        self.spec
            .args
            .iter()
            .map(|arg| {
                let mut rendered = arg
                    .replace("{input}", &input.to_string_lossy())
                    .replace("{output_dir}", &output_dir.to_string_lossy());
                for (key, value) in options {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    rendered = rendered.replace(&format!("{{opt:{}}}", key), &text);
                }
                rendered
            })
            .collect()
    }

    fn parse_stdout(&self, artifact: &ArtifactRef, stdout: &str) -> Vec<Finding> {
        let kind = FindingKind::from(self.spec.finding_kind.as_str());
        stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let (location, text) = match self.spec.line_format {
                    LineFormat::Offset => match line.split_once(':') {
                        Some((offset, rest)) => match offset.trim().parse::<u64>() {
                            Ok(offset) => (Location::Offset { offset }, rest),
                            Err(_) => (whole_path(artifact), line),
                        },
                        None => (whole_path(artifact), line),
                    },
                    LineFormat::Plain => (whole_path(artifact), line),
                };
                Finding::new(kind.clone(), location)
                    .in_artifact(artifact.id())
                    .with_payload(json!({ "line": text }))
            })
            .collect()
    }

    async fn run_one(
        &self,
        artifact: &ArtifactRef,
        options: &AnalyzerOptions,
        cancel: &CancellationToken,
        output: &mut AnalyzerOutput,
    ) -> Result<(), AnalyzerError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| AnalyzerError::Transient(format!("cannot create scratch dir: {}", e)))?;
        let args = self.render_args(artifact.path(), scratch.path(), options);

        debug!(program = %self.spec.program, ?args, "spawning analyzer process");
        let child = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    AnalyzerError::Input(format!("cannot run {}: {}", self.spec.program, e))
                }
                _ => AnalyzerError::Transient(format!("failed to spawn {}: {}", self.spec.program, e)),
            })?;

        let result = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| {
                AnalyzerError::Transient(format!("{} failed: {}", self.spec.program, e))
            })?,
            // Dropping the wait future drops the child, which kills it.
            _ = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&result.stdout);
        let stderr = String::from_utf8_lossy(&result.stderr);
        let findings = self.parse_stdout(artifact, &stdout);

        let Some(code) = result.status.code() else {
            return Err(AnalyzerError::Transient(format!(
                "{} terminated by signal",
                self.spec.program
            )));
        };

        if self.spec.transient_exit_codes.contains(&code) {
            return Err(AnalyzerError::Transient(format!(
                "{} exited with {}: {}",
                self.spec.program,
                code,
                stderr.trim()
            )));
        }
        if !self.spec.ok_exit_codes.contains(&code) {
            let message = format!(
                "{} exited with {} on {}: {}",
                self.spec.program,
                code,
                artifact.name(),
                stderr.trim()
            );
            if findings.is_empty() {
                return Err(AnalyzerError::Input(message));
            }
            warn!("{}", message);
            output.warnings.push(message);
        }

        output.findings.extend(findings);

        if self.spec.collect_outputs {
            for (relative, path) in list_files(scratch.path()).await? {
                let data = tokio::fs::read(&path).await?;
                output.findings.push(
                    Finding::new(FindingKind::CarvedFile, Location::Path { path: relative.clone() })
                        .in_artifact(artifact.id())
                        .with_payload(json!({ "size": data.len() })),
                );
                output.artifacts.push(PendingArtifact::new(
                    format!("{}_{}", artifact.name(), relative.replace('/', "_")),
                    data,
                ));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn descriptor(&self) -> AnalyzerDescriptor {
        AnalyzerDescriptor {
            name: self.spec.name.clone(),
            class: self.spec.class.clone(),
            description: if self.spec.description.is_empty() {
                format!("External tool: {}", self.spec.program)
            } else {
                self.spec.description.clone()
            },
            options: self.spec.options.clone(),
            // External tools may order or time their output differently run to run.
            deterministic: false,
        }
    }

    async fn run(
        &self,
        input: &AnalysisInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput, AnalyzerError> {
        let mut output = AnalyzerOutput::default();
        for (done, artifact) in input.artifacts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AnalyzerError::Cancelled);
            }
            self.run_one(artifact, &input.options, cancel, &mut output).await?;
            input.progress.report(json!({
                "artifacts_done": done + 1,
                "artifacts_total": input.artifacts.len(),
                "findings": output.findings.len(),
                "outputs": output.artifacts.len(),
            }));
        }
        Ok(output)
    }
}

fn whole_path(artifact: &ArtifactRef) -> Location {
    Location::Path {
        path: artifact.path().display().to_string(),
    }
}

/// Files below `root` as (relative path with `/` separators, absolute path),
/// sorted by relative path.
async fn list_files(root: &Path) -> Result<Vec<(String, PathBuf)>, AnalyzerError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((relative, path));
            }
        }
    }
    files.sort();
    Ok(files)
}
