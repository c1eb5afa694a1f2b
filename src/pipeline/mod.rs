//! Pipeline stages from template to score.
//!
//! Each submodule implements one step. The first three are pure and
//! deterministic; the adapters in the middle talk to the outside world
//! behind traits so the harness can be driven by fakes in tests.
//!
//! ## Data Flow
//!
//! ```text
//! analyze ──▶ select ──▶ compose ──▶ render ──▶ reproduce ──▶ encode ──▶ query ──▶ normalize ──▶ score
//! (profile)   (plan)     (LaTeX)     (pdfium)   (physical)    (base64)   (VLM)     (cleanup)     (0..1)
//! ```
//!
//! 1. [`analyze`]: regions, density, adjacency and subject of a template
//! 2. [`select`]: operator plan under context level and legibility budget
//! 3. [`compose`]: apply the plan; seeded, never touches ground truth
//! 4. [`render`]: LaTeX engine as a child process, pages rasterised in
//!    `spawn_blocking` because pdfium is not async-safe
//! 5. [`reproduce`]: physical path: captured photos or print-scan simulation
//! 6. [`encode`]: PNG-encode and base64-wrap page images
//! 7. [`query`]: one VLM call per trial through `edgequake-llm`
//! 8. [`normalize`]: deterministic cleanup of model output before scoring
//! 9. [`score`]: correctness per task and degradation vs. baseline

pub mod analyze;
pub mod compose;
pub mod encode;
pub mod normalize;
pub mod query;
pub mod render;
pub mod reproduce;
pub mod score;
pub mod select;
