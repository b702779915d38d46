//! Built-in analyzers (search, entropy, strings).
//!
//! These run in-process. CPU-bound work is moved to the blocking pool and
//! raced against the cancellation token.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::r#trait::{Analyzer, AnalyzerError};

mod entropy;
mod search;
mod strings;

pub use entropy::{shannon_entropy, EntropyAnalyzer};
pub use search::SearchAnalyzer;
pub use strings::{extract_strings, StringsAnalyzer, StringsEncoding};

/// All built-in analyzers.
pub fn all() -> Vec<Arc<dyn Analyzer>> {
    vec![
        Arc::new(SearchAnalyzer),
        Arc::new(EntropyAnalyzer),
        Arc::new(StringsAnalyzer),
    ]
}

/// Run `f` on the blocking pool, returning early if `cancel` fires.
///
/// A panic inside `f` is resumed on the calling task so the engine's crash
/// isolation sees it.
pub(crate) async fn run_blocking<T, F>(cancel: &CancellationToken, f: F) -> Result<T, AnalyzerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    tokio::select! {
        joined = handle => match joined {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(AnalyzerError::Transient(format!("blocking worker failed: {}", e))),
        },
        _ = cancel.cancelled() => Err(AnalyzerError::Cancelled),
    }
}

/// Read an input artifact, checking for cancellation first.
pub(crate) async fn read_artifact(
    artifact: &triage_core::ArtifactRef,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, AnalyzerError> {
    if cancel.is_cancelled() {
        return Err(AnalyzerError::Cancelled);
    }
    tokio::fs::read(artifact.path()).await.map_err(|e| {
        let message = format!("{}: {}", artifact.path().display(), e);
        match AnalyzerError::from(e) {
            AnalyzerError::Input(_) => AnalyzerError::Input(message),
            _ => AnalyzerError::Transient(message),
        }
    })
}
