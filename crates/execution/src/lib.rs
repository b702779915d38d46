//! Execution layer - slot governance, retries, the engine and aggregation.

#![warn(missing_docs)]

pub mod governor;
pub mod retry;
pub mod config;
pub mod aggregator;
pub mod dispatch;
pub mod engine;

pub use governor::{GovernorConfig, GovernorError, ResourceGovernor, SlotGuard, SlotTicket};
pub use retry::RetryPolicy;
pub use config::{ConfigError, EngineConfig};
pub use aggregator::{AggregateReport, Aggregator, FindingSummary, SummaryRules, TaskReport};
pub use dispatch::{
    ChannelSource, CollectingSink, DispatchError, EnvelopeSource, JsonLinesSink, JsonLinesSource,
    ReportSink,
};
pub use engine::{AdmissionError, Engine, EngineError, RunStats, TaskHandle};
