//! Physical reproduction: what the model sees after print → photograph.
//!
//! Attacks that survive a screen can still die on paper (faint tints wash
//! out, zero-width characters vanish) and vice versa (texture aliases into
//! moiré). The physical path measures that. Two adapters produce a
//! physical artifact from a digital one:
//!
//! * [`CapturedPhotos`] picks up real photos of printed variants from a
//!   directory, matched by variant name.
//! * [`SimulatedPrintScan`] approximates a print-and-photograph round trip
//!   with the `image` crate: resolution loss, blur, paper tint and seeded
//!   speckle. Same seed, same pixels.

use crate::error::{ExamShieldError, RenderError};
use crate::pipeline::compose::VariantDocument;
use crate::pipeline::render::{RenderedArtifact, ReproductionPath};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Turns a digital artifact into its physical counterpart.
#[async_trait]
pub trait Reproducer: Send + Sync {
    async fn reproduce(
        &self,
        digital: &RenderedArtifact,
        variant: &VariantDocument,
        seed: u64,
    ) -> Result<RenderedArtifact, RenderError>;
}

// ── Simulation ───────────────────────────────────────────────────────────

/// Print-and-scan simulation.
#[derive(Debug, Clone)]
pub struct SimulatedPrintScan {
    out_dir: PathBuf,
    /// Fraction of the original resolution kept before upscaling. Default: 0.6.
    pub resolution: f32,
    /// Gaussian blur sigma in pixels. Default: 0.8.
    pub blur_sigma: f32,
    /// Multiplicative paper tint. Default: warm off-white.
    pub tint: [u8; 3],
    /// Fraction of pixels hit by speckle. Default: 0.0015.
    pub speckle: f32,
}

impl SimulatedPrintScan {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            resolution: 0.6,
            blur_sigma: 0.8,
            tint: [250, 246, 232],
            speckle: 0.0015,
        }
    }

    /// Degrade one page image.
    pub fn degrade(&self, img: &DynamicImage, seed: u64) -> DynamicImage {
        let (w, h) = (img.width().max(1), img.height().max(1));
        let scale = self.resolution.clamp(0.1, 1.0);
        let sw = ((w as f32 * scale) as u32).max(1);
        let sh = ((h as f32 * scale) as u32).max(1);
        let degraded = img
            .resize_exact(sw, sh, FilterType::Triangle)
            .resize_exact(w, h, FilterType::Triangle);
        let degraded = if self.blur_sigma > 0.0 {
            degraded.blur(self.blur_sigma)
        } else {
            degraded
        };

        let mut rgb = degraded.to_rgb8();
        for px in rgb.pixels_mut() {
            for c in 0..3 {
                px[c] = (px[c] as u16 * self.tint[c] as u16 / 255) as u8;
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let dots = (w as f64 * h as f64 * self.speckle.max(0.0) as f64) as u64;
        for _ in 0..dots {
            let x = rng.gen_range(0..w);
            let y = rng.gen_range(0..h);
            let shade: u8 = if rng.gen_bool(0.7) { rng.gen_range(40..120) } else { 255 };
            rgb.put_pixel(x, y, Rgb([shade, shade, shade]));
        }
        DynamicImage::ImageRgb8(rgb)
    }

    fn reproduce_blocking(&self, pages: &[PathBuf], dest: &Path, seed: u64) -> Result<Vec<PathBuf>, RenderError> {
        std::fs::create_dir_all(dest).map_err(|e| RenderError::Io(format!("{}: {e}", dest.display())))?;
        let mut out = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let img = image::open(page).map_err(|e| RenderError::Rasterise(format!("{}: {e}", page.display())))?;
            let degraded = self.degrade(&img, seed.wrapping_add(i as u64));
            let path = dest.join(format!("physical-{:03}.png", i + 1));
            degraded
                .save_with_format(&path, image::ImageFormat::Png)
                .map_err(|e| RenderError::Io(format!("{}: {e}", path.display())))?;
            out.push(path);
        }
        Ok(out)
    }
}

#[async_trait]
impl Reproducer for SimulatedPrintScan {
    async fn reproduce(
        &self,
        digital: &RenderedArtifact,
        variant: &VariantDocument,
        seed: u64,
    ) -> Result<RenderedArtifact, RenderError> {
        let this = self.clone();
        let pages = digital.pages.clone();
        let dest = self.out_dir.join(variant.id.replace(['/', '\\', ':'], "_"));
        let produced = tokio::task::spawn_blocking(move || this.reproduce_blocking(&pages, &dest, seed))
            .await
            .map_err(|e| RenderError::Rasterise(format!("reproduction task panicked: {e}")))??;
        debug!("{}: simulated print of {} page(s)", variant.id, produced.len());
        RenderedArtifact::from_files(&variant.id, ReproductionPath::Physical, produced, None).await
    }
}

// ── Captured photos ──────────────────────────────────────────────────────

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Photos of printed variants, one directory for the whole run.
///
/// A photo belongs to a variant when its file stem is the variant id or
/// combination name, optionally followed by `_<page>`
/// (`exam__light_protection_2.jpg`). Pages sort by file name.
#[derive(Debug, Clone)]
pub struct CapturedPhotos {
    dir: PathBuf,
}

impl CapturedPhotos {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ExamShieldError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ExamShieldError::PhotoSet {
                path: dir,
                detail: "not a directory".into(),
            });
        }
        Ok(Self { dir })
    }

    /// Photo files for `variant`, in page order.
    pub fn photos_for(&self, variant: &VariantDocument) -> Result<Vec<PathBuf>, RenderError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RenderError::Io(format!("{}: {e}", self.dir.display())))?;
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                let ext_ok = p
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| PHOTO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
                let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                ext_ok && (stem_matches(stem, &variant.id) || stem_matches(stem, &variant.combination))
            })
            .collect();
        found.sort();
        Ok(found)
    }
}

fn stem_matches(stem: &str, name: &str) -> bool {
    match stem.strip_prefix(name) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('_')
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())),
        None => false,
    }
}

#[async_trait]
impl Reproducer for CapturedPhotos {
    async fn reproduce(
        &self,
        _digital: &RenderedArtifact,
        variant: &VariantDocument,
        _seed: u64,
    ) -> Result<RenderedArtifact, RenderError> {
        let photos = self.photos_for(variant)?;
        if photos.is_empty() {
            return Err(RenderError::Io(format!(
                "no photos for {} in {}",
                variant.id,
                self.dir.display()
            )));
        }
        info!("{}: using {} captured photo(s)", variant.id, photos.len());
        RenderedArtifact::from_files(&variant.id, ReproductionPath::Physical, photos, None).await
    }
}
