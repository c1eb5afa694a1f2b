//! Error types for the examshield library.
//!
//! Failures are isolated to the smallest unit that can absorb them:
//!
//! * [`ExamShieldError`] is fatal: the run cannot proceed at all
//!   (template missing, invalid configuration, ledger unreadable). Returned
//!   as `Err(ExamShieldError)` from the harness entry points.
//!
//! * [`OperatorError`]: one operator application failed. The composition
//!   engine skips it and records it on the variant.
//!
//! * [`RenderError`]: one variant failed to compile. Every trial planned for
//!   that variant is recorded as failed; other variants continue.
//!
//! * [`QueryError`]: one model call failed. Transient errors are retried
//!   by [`crate::retry::RetryPolicy`]; permanent ones fail the trial.
//!
//! * [`ScoringAmbiguity`]: a response could not be judged. The trial is
//!   recorded as unscored instead of being coerced into a number.
//!
//! Analysis problems are not errors at all: see [`AnalysisWarning`].

use crate::document::BlockId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the examshield library.
#[derive(Debug, Error)]
pub enum ExamShieldError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Template file was not found at the given path.
    #[error("Template not found: '{path}'\nCheck the path exists and is readable.")]
    TemplateNotFound { path: PathBuf },

    /// Template file exists but could not be read as UTF-8 text.
    #[error("Failed to read template '{path}': {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Template has no `\begin{document}` ... `\end{document}` body.
    #[error("Template '{name}' has no document body")]
    MissingDocumentBody { name: String },

    /// Photo directory or manifest for the physical path is unusable.
    #[error("Captured photo set at '{path}' is unusable: {detail}")]
    PhotoSet { path: PathBuf, detail: String },

    // ── Catalog errors ────────────────────────────────────────────────────
    /// An attack or preset name is not in the catalog.
    #[error("Unknown attack '{name}'\nRun `examshield catalog` to list available attacks.")]
    UnknownAttack { name: String },

    /// The requested operator combination cannot be expressed for this document.
    #[error("Unsupported combination: {0}")]
    Unsupported(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// pdfium could not be loaded.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium on the library search path.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Run-state errors ──────────────────────────────────────────────────
    /// The run ledger could not be read, appended or synced.
    #[error("Ledger I/O failed for '{path}': {source}")]
    LedgerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A ledger line is not a valid record.
    #[error("Ledger '{path}' is corrupt at line {line}: {detail}")]
    CorruptLedger {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    /// Could not create or write an output file (report, variant, run state).
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run directory belongs to a different configuration.
    #[error("Run '{run_dir}' was started with a different configuration (fingerprint {expected}, got {found})")]
    RunMismatch {
        run_dir: PathBuf,
        expected: String,
        found: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled before every trial reached a terminal state.
    #[error("Run cancelled with {pending} trial(s) still pending")]
    Cancelled { pending: usize },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ExamShieldError {
    fn from(e: serde_json::Error) -> Self {
        ExamShieldError::Internal(format!("serialisation: {e}"))
    }
}

/// A region the analyzer could not parse cleanly.
///
/// The region is still present in the profile, classified as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    pub region: BlockId,
    pub message: String,
}

/// A single operator application that could not be performed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OperatorError {
    /// The fragment has unbalanced braces or an unterminated construct.
    #[error("{operator} on {region}: malformed fragment: {detail}")]
    MalformedFragment {
        operator: String,
        region: BlockId,
        detail: String,
    },

    /// The operator has no effect on this region kind.
    #[error("{operator} cannot target {region}")]
    NotApplicable { operator: String, region: BlockId },

    /// The application references a region the document does not have.
    #[error("{operator}: unknown region {region}")]
    UnknownRegion { operator: String, region: BlockId },
}

/// A variant that failed to compile or rasterise.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RenderError {
    /// The LaTeX engine rejected the document.
    ///
    /// `region` is set when the engine's error line falls inside a block.
    #[error("compile failed{}: {detail}", region.as_ref().map(|r| format!(" in {r}")).unwrap_or_default())]
    Compile {
        region: Option<BlockId>,
        detail: String,
    },

    /// The engine did not finish within the configured timeout.
    #[error("compile timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The engine binary could not be started.
    #[error("could not start '{engine}': {detail}")]
    EngineUnavailable { engine: String, detail: String },

    /// The PDF was produced but could not be rasterised.
    #[error("rasterisation failed: {0}")]
    Rasterise(String),

    /// Artifact bytes could not be written or read.
    #[error("artifact I/O failed: {0}")]
    Io(String),
}

/// A model call that did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum QueryError {
    /// Rate limits, timeouts, 5xx: worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad credentials, unsupported model, malformed request: retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl QueryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }
}

/// A response for which no verdict could be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("unscored: {reason}")]
pub struct ScoringAmbiguity {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_names_region() {
        let e = RenderError::Compile {
            region: Some(BlockId::new(3)),
            detail: "Undefined control sequence".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("b3"), "got: {msg}");
        assert!(msg.contains("Undefined control sequence"));
    }

    #[test]
    fn compile_error_without_region() {
        let e = RenderError::Compile {
            region: None,
            detail: "Emergency stop".into(),
        };
        assert_eq!(e.to_string(), "compile failed: Emergency stop");
    }

    #[test]
    fn query_error_classification() {
        assert!(QueryError::Transient("429".into()).is_transient());
        assert!(!QueryError::Permanent("401".into()).is_transient());
    }

    #[test]
    fn cancelled_display() {
        let e = ExamShieldError::Cancelled { pending: 4 };
        assert!(e.to_string().contains("4 trial(s)"));
    }

    #[test]
    fn operator_error_roundtrips_through_json() {
        let e = OperatorError::MalformedFragment {
            operator: "kerning".into(),
            region: BlockId::new(1),
            detail: "unbalanced braces".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: OperatorError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
