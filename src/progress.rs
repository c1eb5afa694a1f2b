//! Progress-callback trait for experiment events.
//!
//! Inject an [`Arc<dyn ExperimentProgressCallback>`] via
//! [`crate::config::ExperimentConfigBuilder::progress_callback`] to follow a
//! run as it moves through its stages. The CLI drives its progress bar from
//! these events.
//!
//! Trials run concurrently, so `on_trial_*` may be called from several
//! tasks at once. Implementations must synchronise their own state.
//!
//! # Example
//!
//! ```rust
//! use examshield::{ExperimentProgressCallback, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ExperimentProgressCallback for Counter {
//!     fn on_trial_complete(&self, _trial_id: &str, _done: usize, _total: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let c = Counter(AtomicUsize::new(0));
//! c.on_stage(Stage::QueryingModels);
//! c.on_trial_complete("t", 1, 3);
//! assert_eq!(c.0.load(Ordering::SeqCst), 1);
//! ```

use crate::harness::Stage;
use std::sync::Arc;

/// Called by the harness as a run progresses. Every method is a no-op by
/// default.
pub trait ExperimentProgressCallback: Send + Sync {
    /// The run entered `stage`.
    fn on_stage(&self, stage: Stage) {
        let _ = stage;
    }

    /// A variant was composed (or loaded from the ledger).
    fn on_variant(&self, variant_id: &str, applied: usize, failed: usize) {
        let _ = (variant_id, applied, failed);
    }

    /// A variant failed to render; its trials will be recorded as failed.
    fn on_render_error(&self, variant_id: &str, error: &str) {
        let _ = (variant_id, error);
    }

    /// Trials are about to be dispatched. `skipped` were finished in an
    /// earlier session.
    fn on_trials_start(&self, total: usize, skipped: usize) {
        let _ = (total, skipped);
    }

    /// A trial reached a terminal state with a response.
    fn on_trial_complete(&self, trial_id: &str, done: usize, total: usize) {
        let _ = (trial_id, done, total);
    }

    /// A trial failed after retries.
    fn on_trial_error(&self, trial_id: &str, error: &str, done: usize, total: usize) {
        let _ = (trial_id, error, done, total);
    }

    /// The report was written.
    fn on_run_complete(&self, valid: usize, failed: usize, unscored: usize) {
        let _ = (valid, failed, unscored);
    }
}

/// A no-op implementation; the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExperimentProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExperimentConfig`].
pub type ProgressCallback = Arc<dyn ExperimentProgressCallback>;
