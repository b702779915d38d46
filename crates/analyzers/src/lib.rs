//! Analyzers
//!
//! Pluggable scan, carve and measurement units behind one trait, plus the
//! registry the engine resolves envelopes against.

#![warn(missing_docs)]

pub mod r#trait;
pub mod options;
pub mod progress;
pub mod registry;
pub mod builtin;
pub mod command;

pub use r#trait::{AnalysisInput, Analyzer, AnalyzerDescriptor, AnalyzerError, AnalyzerOutput};
pub use options::{prepare_options, OptionError, OptionKind, OptionSpec, OptionsExt};
pub use progress::{Progress, ProgressReceiver};
pub use registry::{AnalyzerRegistry, PreparedAnalyzer, RegistryError};
pub use builtin::{EntropyAnalyzer, SearchAnalyzer, StringsAnalyzer, StringsEncoding};
pub use command::{CommandAnalyzer, CommandSpec, LineFormat};
