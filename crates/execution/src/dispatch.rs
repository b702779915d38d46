//! Envelope sources and report sinks for the dispatch loop.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use triage_core::TaskEnvelope;

use crate::aggregator::TaskReport;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Reading or writing failed
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One envelope could not be decoded; the source stays usable
    #[error("malformed envelope on line {line}: {message}")]
    Malformed {
        /// Line number, starting at 1
        line: usize,
        /// Decoder message
        message: String,
    },

    /// A report could not be encoded
    #[error("cannot encode report: {0}")]
    Encode(#[from] serde_json::Error),

    /// The other side went away
    #[error("report channel closed")]
    Closed,
}

/// Where envelopes come from (queue, file, socket...).
#[async_trait]
pub trait EnvelopeSource: Send {
    /// Next envelope, or `None` once the source is exhausted.
    ///
    /// Must be cancellation safe: the dispatch loop polls it inside `select!`.
    async fn next(&mut self) -> Result<Option<TaskEnvelope>, DispatchError>;
}

/// Where finished reports go.
#[async_trait]
pub trait ReportSink: Send {
    /// Deliver one report.
    async fn send(&mut self, report: TaskReport) -> Result<(), DispatchError>;
}

/// Envelopes pushed through an in-process channel.
pub struct ChannelSource {
    receiver: mpsc::Receiver<TaskEnvelope>,
}

impl ChannelSource {
    /// Create a bounded channel and its source.
    pub fn channel(capacity: usize) -> (mpsc::Sender<TaskEnvelope>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (sender, Self { receiver })
    }
}

impl From<mpsc::Receiver<TaskEnvelope>> for ChannelSource {
    fn from(receiver: mpsc::Receiver<TaskEnvelope>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl EnvelopeSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<TaskEnvelope>, DispatchError> {
        Ok(self.receiver.recv().await)
    }
}

/// One JSON envelope per line. Blank lines are skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    /// Read from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EnvelopeSource for JsonLinesSource<R> {
    async fn next(&mut self) -> Result<Option<TaskEnvelope>, DispatchError> {
        loop {
            let Some(text) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| DispatchError::Malformed {
                    line: self.line,
                    message: e.to_string(),
                });
        }
    }
}

/// Writes each report as one JSON line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    /// Write to `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Get the writer back.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ReportSink for JsonLinesSink<W> {
    async fn send(&mut self, report: TaskReport) -> Result<(), DispatchError> {
        let mut line = serde_json::to_vec(&report)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Vec<TaskReport>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, in completion order.
    pub fn reports(&self) -> &[TaskReport] {
        &self.reports
    }

    /// Take the reports.
    pub fn into_reports(self) -> Vec<TaskReport> {
        self.reports
    }
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn send(&mut self, report: TaskReport) -> Result<(), DispatchError> {
        self.reports.push(report);
        Ok(())
    }
}

#[async_trait]
impl ReportSink for mpsc::Sender<TaskReport> {
    async fn send(&mut self, report: TaskReport) -> Result<(), DispatchError> {
        mpsc::Sender::send(self, report)
            .await
            .map_err(|_| DispatchError::Closed)
    }
}
