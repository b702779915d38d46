//! Analyzer registry.

use std::collections::HashMap;
use std::sync::Arc;
use triage_core::AnalyzerOptions;

use crate::options::{prepare_options, OptionError};
use crate::r#trait::{Analyzer, AnalyzerDescriptor};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Name already taken
    #[error("analyzer '{0}' is already registered")]
    Duplicate(String),

    /// No analyzer with that name
    #[error("unknown analyzer '{0}'")]
    UnknownAnalyzer(String),

    /// Options failed validation
    #[error(transparent)]
    InvalidOptions(#[from] OptionError),
}

struct Entry {
    analyzer: Arc<dyn Analyzer>,
    descriptor: AnalyzerDescriptor,
}

/// An analyzer resolved for one envelope, with validated options.
#[derive(Clone)]
pub struct PreparedAnalyzer {
    /// The analyzer
    pub analyzer: Arc<dyn Analyzer>,
    /// Its descriptor
    pub descriptor: AnalyzerDescriptor,
    /// Options with defaults applied
    pub options: AnalyzerOptions,
}

/// Registry for analyzers, keyed by name.
///
/// Populated at startup; the engine only reads from it afterwards, so adding
/// a scan type never touches the dispatcher.
pub struct AnalyzerRegistry {
    analyzers: HashMap<String, Entry>,
    by_class: HashMap<String, Vec<String>>,
}

impl AnalyzerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            analyzers: HashMap::new(),
            by_class: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in analyzers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for analyzer in crate::builtin::all() {
            // Built-in names are distinct.
            let _ = registry.register(analyzer);
        }
        registry
    }

    /// Register an analyzer.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) -> Result<(), RegistryError> {
        let descriptor = analyzer.descriptor();
        let name = analyzer.name().to_string();
        if self.analyzers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        tracing::debug!(analyzer = %name, class = %descriptor.class, "registered analyzer");
        self.by_class
            .entry(descriptor.class.clone())
            .or_default()
            .push(name.clone());
        self.analyzers.insert(name, Entry { analyzer, descriptor });
        Ok(())
    }

    /// Get an analyzer by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(name).map(|e| e.analyzer.clone())
    }

    /// Get a descriptor by name.
    pub fn descriptor(&self, name: &str) -> Option<&AnalyzerDescriptor> {
        self.analyzers.get(name).map(|e| &e.descriptor)
    }

    /// List all descriptors, sorted by name.
    pub fn list(&self) -> Vec<&AnalyzerDescriptor> {
        let mut all: Vec<_> = self.analyzers.values().map(|e| &e.descriptor).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Find analyzer names by resource class.
    pub fn find_by_class(&self, class: &str) -> Vec<&str> {
        self.by_class
            .get(class)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
            .collect()
    }

    /// Resolve an analyzer and validate options for it.
    pub fn prepare(
        &self,
        name: &str,
        options: &AnalyzerOptions,
    ) -> Result<PreparedAnalyzer, RegistryError> {
        let entry = self
            .analyzers
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAnalyzer(name.to_string()))?;
        let options = prepare_options(&entry.descriptor.options, options)?;
        Ok(PreparedAnalyzer {
            analyzer: entry.analyzer.clone(),
            descriptor: entry.descriptor.clone(),
            options,
        })
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
