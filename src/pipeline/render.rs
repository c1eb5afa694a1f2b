//! Rendering: compile a variant's LaTeX and rasterise the resulting PDF.
//!
//! The core never looks inside the artifacts it gets back. It hashes them,
//! forwards page images to the model adapter and records where they live.
//! [`Renderer`] is the seam; [`LatexRenderer`] is the stock implementation.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and must not run on Tokio worker threads. Rasterisation moves to
//! the blocking pool; the LaTeX engine itself runs as a child process
//! through `tokio::process`.
//!
//! ## Compile failures
//!
//! The engine runs with `-halt-on-error`. Its log names the input line of
//! the first error (`l.42 ...`); that line is mapped back to the region
//! whose source it falls in, so the report can say which block broke.

use crate::config::RenderSettings;
use crate::error::{ExamShieldError, RenderError};
use crate::pipeline::compose::{content_hash, VariantDocument};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How the model sees the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReproductionPath {
    /// Rasterised straight from the compiled PDF.
    Digital,
    /// Printed and photographed (or a simulation of it).
    Physical,
}

impl ReproductionPath {
    pub const ALL: [ReproductionPath; 2] = [ReproductionPath::Digital, ReproductionPath::Physical];

    pub fn name(self) -> &'static str {
        match self {
            ReproductionPath::Digital => "digital",
            ReproductionPath::Physical => "physical",
        }
    }
}

impl fmt::Display for ReproductionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReproductionPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "digital" => Ok(ReproductionPath::Digital),
            "physical" | "print" | "photo" => Ok(ReproductionPath::Physical),
            other => Err(format!("unknown reproduction path '{other}' (expected digital or physical)")),
        }
    }
}

/// Output of a render or reproduction step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedArtifact {
    /// `<variant id>@<path>`.
    pub id: String,
    pub variant_id: String,
    pub path: ReproductionPath,
    /// One image per page, in page order.
    pub pages: Vec<PathBuf>,
    pub pdf: Option<PathBuf>,
    /// SHA-256 over the page images (and the PDF when present), hex.
    pub content_hash: String,
}

impl RenderedArtifact {
    pub fn artifact_id(variant_id: &str, path: ReproductionPath) -> String {
        format!("{variant_id}@{path}")
    }

    /// Build an artifact record, hashing the files it points at.
    pub async fn from_files(
        variant_id: &str,
        path: ReproductionPath,
        pages: Vec<PathBuf>,
        pdf: Option<PathBuf>,
    ) -> Result<Self, RenderError> {
        let mut bytes = Vec::new();
        for file in pdf.iter().chain(pages.iter()) {
            let chunk = tokio::fs::read(file)
                .await
                .map_err(|e| RenderError::Io(format!("{}: {e}", file.display())))?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(Self {
            id: Self::artifact_id(variant_id, path),
            variant_id: variant_id.to_string(),
            path,
            pages,
            pdf,
            content_hash: content_hash(&bytes),
        })
    }
}

/// Turns a variant into page images.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn compile(&self, variant: &VariantDocument) -> Result<RenderedArtifact, RenderError>;
}

// ── LaTeX + pdfium ───────────────────────────────────────────────────────

/// Compiles with a LaTeX engine in a scratch directory, then rasterises
/// every page to PNG under `out_dir/<variant id>/`.
#[derive(Debug, Clone)]
pub struct LatexRenderer {
    settings: RenderSettings,
    out_dir: PathBuf,
}

impl LatexRenderer {
    pub fn new(settings: RenderSettings, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            out_dir: out_dir.into(),
        }
    }

    /// Fail early when pdfium cannot be loaded, before any variant compiles.
    pub fn check_pdfium() -> Result<(), ExamShieldError> {
        bind_pdfium().map(|_| ()).map_err(|e| ExamShieldError::PdfiumBindingFailed(e.to_string()))
    }

    async fn run_engine(&self, workdir: &Path, tex: &Path) -> Result<(), RenderError> {
        let engine = &self.settings.engine;
        let mut cmd = Command::new(engine);
        cmd.arg("-interaction=nonstopmode")
            .arg("-halt-on-error")
            .arg("-output-directory")
            .arg(workdir)
            .arg(tex)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| RenderError::EngineUnavailable {
            engine: engine.clone(),
            detail: e.to_string(),
        })?;

        let secs = self.settings.timeout_secs;
        let output = match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RenderError::Io(e.to_string()))?,
            Err(_) => return Err(RenderError::Timeout { secs }),
        };

        if output.status.success() {
            return Ok(());
        }
        let log = match tokio::fs::read_to_string(tex.with_extension("log")).await {
            Ok(log) => log,
            Err(_) => String::from_utf8_lossy(&output.stdout).into_owned(),
        };
        Err(RenderError::Compile {
            region: None,
            detail: first_error(&log).unwrap_or_else(|| format!("{engine} exited with {}", output.status)),
        })
    }
}

#[async_trait]
impl Renderer for LatexRenderer {
    async fn compile(&self, variant: &VariantDocument) -> Result<RenderedArtifact, RenderError> {
        let scratch = tempfile::tempdir().map_err(|e| RenderError::Io(e.to_string()))?;
        let tex = scratch.path().join("variant.tex");
        tokio::fs::write(&tex, &variant.latex)
            .await
            .map_err(|e| RenderError::Io(e.to_string()))?;

        debug!("{}: compiling with {}", variant.id, self.settings.engine);
        if let Err(e) = self.run_engine(scratch.path(), &tex).await {
            let log = tokio::fs::read_to_string(tex.with_extension("log"))
                .await
                .unwrap_or_default();
            return Err(locate_failure(e, &log, variant));
        }

        let dest = self.out_dir.join(sanitize(&variant.id));
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| RenderError::Io(format!("{}: {e}", dest.display())))?;
        let pdf = dest.join("variant.pdf");
        tokio::fs::copy(tex.with_extension("pdf"), &pdf)
            .await
            .map_err(|e| RenderError::Io(format!("missing PDF output: {e}")))?;

        let pages = rasterise(pdf.clone(), dest, self.settings.max_rendered_pixels).await?;
        info!("{}: rendered {} page(s)", variant.id, pages.len());
        RenderedArtifact::from_files(&variant.id, ReproductionPath::Digital, pages, Some(pdf)).await
    }
}

/// Rasterise every page of `pdf` into `dir/page-NNN.png`.
pub async fn rasterise(pdf: PathBuf, dir: PathBuf, max_pixels: u32) -> Result<Vec<PathBuf>, RenderError> {
    tokio::task::spawn_blocking(move || rasterise_blocking(&pdf, &dir, max_pixels))
        .await
        .map_err(|e| RenderError::Rasterise(format!("render task panicked: {e}")))?
}

fn bind_pdfium() -> Result<Pdfium, RenderError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            Pdfium::bind_to_library(&lib)
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| RenderError::EngineUnavailable {
        engine: "pdfium".into(),
        detail: format!("{e:?}"),
    })?;
    Ok(Pdfium::new(bindings))
}

fn rasterise_blocking(pdf: &Path, dir: &Path, max_pixels: u32) -> Result<Vec<PathBuf>, RenderError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf, None)
        .map_err(|e| RenderError::Rasterise(format!("{:?}", e)))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut paths = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError::Rasterise(format!("page {}: {:?}", idx + 1, e)))?;
        let image = bitmap.as_image();
        let path = dir.join(format!("page-{:03}.png", idx + 1));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| RenderError::Io(format!("{}: {e}", path.display())))?;
        debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
        paths.push(path);
    }
    if paths.is_empty() {
        warn!("{}: PDF has no pages", pdf.display());
        return Err(RenderError::Rasterise("PDF has no pages".into()));
    }
    Ok(paths)
}

// ── Log parsing ──────────────────────────────────────────────────────────

static ERROR_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^! (.+)$").unwrap());
static INPUT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^l\.(\d+)").unwrap());

/// First `! ...` message in a TeX log.
pub fn first_error(log: &str) -> Option<String> {
    ERROR_LINE.captures(log).map(|c| c[1].trim().to_string())
}

/// Input line the first error points at.
pub fn error_line(log: &str) -> Option<usize> {
    let start = ERROR_LINE.find(log).map(|m| m.start()).unwrap_or(0);
    INPUT_LINE
        .captures(&log[start..])
        .and_then(|c| c[1].parse().ok())
}

/// Attach the offending region to a compile error when the log locates it.
pub fn locate_failure(err: RenderError, log: &str, variant: &VariantDocument) -> RenderError {
    match err {
        RenderError::Compile { region: None, detail } => RenderError::Compile {
            region: error_line(log).and_then(|line| variant.region_at_line(line)),
            detail,
        },
        other => other,
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::CombinationSpec;
    use crate::document::SourceDocument;
    use crate::pipeline::compose::compose;

    const LOG: &str = "This is LuaHBTeX\n(./variant.tex\n! Undefined control sequence.\nl.9 $\\esEq\n           a$\n";

    #[test]
    fn log_parsing_finds_message_and_line() {
        assert_eq!(first_error(LOG).as_deref(), Some("Undefined control sequence."));
        assert_eq!(error_line(LOG), Some(9));
        assert_eq!(first_error("all good"), None);
    }

    #[test]
    fn compile_error_is_mapped_to_region() {
        let src = "\\documentclass{article}\n\\begin{document}\nFirst paragraph.\n\n$$x^2$$\n\\end{document}\n";
        let doc = SourceDocument::parse("t", src).unwrap();
        let variant = compose(&doc, &CombinationSpec::empty("baseline_clean", 1));
        let line = variant.spans.last().unwrap().first_line;
        let log = format!("! Missing $ inserted.\nl.{line} $$x^2$$\n");
        let err = locate_failure(
            RenderError::Compile {
                region: None,
                detail: "Missing $ inserted.".into(),
            },
            &log,
            &variant,
        );
        match err {
            RenderError::Compile { region, .. } => assert_eq!(region, Some(variant.spans.last().unwrap().region)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reproduction_path_parses() {
        assert_eq!("Digital".parse::<ReproductionPath>().unwrap(), ReproductionPath::Digital);
        assert_eq!("photo".parse::<ReproductionPath>().unwrap(), ReproductionPath::Physical);
        assert!("fax".parse::<ReproductionPath>().is_err());
        assert_eq!(RenderedArtifact::artifact_id("a__b", ReproductionPath::Physical), "a__b@physical");
    }

    #[tokio::test]
    async fn artifact_hash_covers_page_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("p.png");
        tokio::fs::write(&page, b"fake page").await.unwrap();
        let a = RenderedArtifact::from_files("v", ReproductionPath::Digital, vec![page.clone()], None)
            .await
            .unwrap();
        assert_eq!(a.content_hash, content_hash(b"fake page"));
        assert_eq!(a.id, "v@digital");
    }

    #[tokio::test]
    async fn missing_engine_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = LatexRenderer::new(
            RenderSettings {
                engine: "examshield-no-such-engine".into(),
                ..RenderSettings::default()
            },
            dir.path(),
        );
        let doc = SourceDocument::parse("t", "\\begin{document}\nx\n\\end{document}\n").unwrap();
        let variant = compose(&doc, &CombinationSpec::empty("baseline_clean", 1));
        let err = renderer.compile(&variant).await.unwrap_err();
        assert!(matches!(err, RenderError::EngineUnavailable { .. }), "got {err:?}");
    }
}
