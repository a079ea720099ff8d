//! Page rasterisation and page counting.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and CPU-heavy rendering.
//! Every call goes through `tokio::task::spawn_blocking` so the Tokio worker
//! threads never stall while a page renders. Each blocking-pool thread binds
//! the library on first use and keeps the handle for later pages.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Pages are rendered at a fixed DPI chosen for inference fidelity, but page
//! sizes vary wildly: an A0 scan at 144 DPI is over 6,000 px wide.
//! `max_rendered_pixels` caps the longest edge regardless of physical size.
//!
//! ## Page counting
//!
//! [`count_pages`] never fails. It tries, in order:
//! 1. the rasterizer's own parse,
//! 2. a raw count of `/Type /Page` objects in the file bytes,
//! 3. an estimate from the byte size.

use crate::config::PipelineConfig;
use crate::model::PageCountSource;
use image::DynamicImage;
use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use pdfium_render::prelude::*;
use regex::bytes::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RenderError {
    /// The bytes could not be opened as a PDF.
    #[error("unreadable PDF: {0}")]
    Unreadable(String),

    #[error("page {ordinal} out of range (document has {total} pages)")]
    PageOutOfRange { ordinal: u32, total: u32 },

    #[error("page {ordinal}: {detail}")]
    Failed { ordinal: u32, detail: String },

    /// The pdfium library could not be loaded.
    #[error("pdfium binding failed: {0}")]
    Binding(String),

    /// The blocking render task panicked or was cancelled.
    #[error("render task failed: {0}")]
    Task(String),
}

/// Rendering knobs taken from [`PipelineConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub dpi: u32,
    pub max_pixels: u32,
}

impl RenderSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
        }
    }

    /// pdfium renders at 72 points per inch at scale 1.0.
    pub fn scale(&self) -> f32 {
        self.dpi as f32 / 72.0
    }
}

/// Turns PDF bytes into page images.
///
/// Implementations are blocking; callers go through [`render_page`] and
/// [`count_pages`], which move the work off the async runtime.
pub trait PageRasterizer: Send + Sync {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, RenderError>;

    /// Render the 1-based `ordinal`.
    fn render(&self, pdf: &[u8], ordinal: u32, settings: &RenderSettings) -> Result<DynamicImage, RenderError>;
}

/// [`PageRasterizer`] backed by the pdfium library.
///
/// Looks for the library in `PDFIUM_LIB_PATH`, then the working directory,
/// then the system library path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    library_dir: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self {
            library_dir: std::env::var("PDFIUM_LIB_PATH").ok().filter(|p| !p.is_empty()),
        }
    }

    pub fn with_library_dir(dir: impl Into<String>) -> Self {
        Self {
            library_dir: Some(dir.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, RenderError> {
        let dir = self.library_dir.as_deref().unwrap_or("./");
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| RenderError::Binding(format!("{:?}", e)))?;
        debug!("pdfium bound on {:?}", std::thread::current().id());
        Ok(Pdfium::new(bindings))
    }

    /// Run `f` against this thread's pdfium handle, binding it on first use.
    /// A failed bind is not cached, so a later call can retry.
    fn with_pdfium<T>(&self, f: impl FnOnce(&Pdfium) -> Result<T, RenderError>) -> Result<T, RenderError> {
        PDFIUM.with(|cell| {
            let pdfium = cell.get_or_try_init(|| self.bind())?;
            f(pdfium)
        })
    }
}

thread_local! {
    static PDFIUM: OnceCell<Pdfium> = const { OnceCell::new() };
}

impl PageRasterizer for PdfiumRasterizer {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, RenderError> {
        self.with_pdfium(|pdfium| {
            let document = pdfium
                .load_pdf_from_byte_slice(pdf, None)
                .map_err(|e| RenderError::Unreadable(format!("{:?}", e)))?;
            Ok(document.pages().len() as u32)
        })
    }

    fn render(&self, pdf: &[u8], ordinal: u32, settings: &RenderSettings) -> Result<DynamicImage, RenderError> {
        self.with_pdfium(|pdfium| render_with(pdfium, pdf, ordinal, settings))
    }
}

fn render_with(pdfium: &Pdfium, pdf: &[u8], ordinal: u32, settings: &RenderSettings) -> Result<DynamicImage, RenderError> {
    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| RenderError::Unreadable(format!("{:?}", e)))?;

    let pages = document.pages();
    let total = pages.len() as u32;
    if ordinal == 0 || ordinal > total {
        return Err(RenderError::PageOutOfRange { ordinal, total });
    }

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(settings.scale())
        .set_maximum_width(settings.max_pixels as i32)
        .set_maximum_height(settings.max_pixels as i32);

    let page = pages
        .get((ordinal - 1) as u16)
        .map_err(|e| RenderError::Failed {
            ordinal,
            detail: format!("{:?}", e),
        })?;
    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| RenderError::Failed {
            ordinal,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!("Rendered page {} → {}x{} px", ordinal, image.width(), image.height());
    Ok(image)
}

/// Render one page on the blocking pool.
pub async fn render_page(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: Arc<Vec<u8>>,
    ordinal: u32,
    settings: RenderSettings,
) -> Result<DynamicImage, RenderError> {
    tokio::task::spawn_blocking(move || rasterizer.render(&pdf, ordinal, &settings))
        .await
        .map_err(|e| RenderError::Task(e.to_string()))?
}

static PAGE_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Type\s*/Page\b").unwrap());

/// Count `/Type /Page` objects (not `/Pages` tree nodes) in raw PDF bytes.
pub fn structural_page_count(pdf: &[u8]) -> u32 {
    PAGE_OBJECT.find_iter(pdf).count() as u32
}

/// Estimate a page count from the byte size. Never zero.
pub fn estimated_page_count(len: usize, bytes_per_page: usize) -> u32 {
    let per_page = bytes_per_page.max(1);
    (len.div_ceil(per_page) as u32).max(1)
}

/// Determine a document's page count, degrading through the fallback tiers
/// instead of failing.
pub async fn count_pages(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: Arc<Vec<u8>>,
    fallback_bytes_per_page: usize,
) -> (u32, PageCountSource) {
    let parse_bytes = Arc::clone(&pdf);
    let parsed = tokio::task::spawn_blocking(move || rasterizer.page_count(&parse_bytes))
        .await
        .map_err(|e| RenderError::Task(e.to_string()))
        .and_then(|r| r);

    match parsed {
        Ok(n) if n > 0 => {
            info!("PDF parsed: {} pages", n);
            return (n, PageCountSource::Parsed);
        }
        Ok(_) => warn!("PDF parsed with zero pages, falling back to structural count"),
        Err(e) => warn!("PDF parse failed ({}), falling back to structural count", e),
    }

    let structural = structural_page_count(&pdf);
    if structural > 0 {
        info!("Structural page count: {}", structural);
        return (structural, PageCountSource::Structural);
    }

    let estimate = estimated_page_count(pdf.len(), fallback_bytes_per_page);
    warn!(
        "No page objects found, estimating {} pages from {} bytes",
        estimate,
        pdf.len()
    );
    (estimate, PageCountSource::Estimated)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl PageRasterizer for Broken {
        fn page_count(&self, _pdf: &[u8]) -> Result<u32, RenderError> {
            Err(RenderError::Unreadable("bad xref".into()))
        }

        fn render(&self, _pdf: &[u8], ordinal: u32, _s: &RenderSettings) -> Result<DynamicImage, RenderError> {
            Err(RenderError::Failed {
                ordinal,
                detail: "bad xref".into(),
            })
        }
    }

    fn bound_handle() -> Option<*const Pdfium> {
        PDFIUM.with(|cell| cell.get().map(|p| p as *const Pdfium))
    }

    #[test]
    fn pdfium_is_bound_once_per_thread() {
        let rasterizer = PdfiumRasterizer::new();
        let _ = rasterizer.page_count(b"not a pdf");
        let Some(first) = bound_handle() else {
            // no pdfium library on this machine
            return;
        };
        let _ = rasterizer.page_count(b"still not a pdf");
        let settings = RenderSettings { dpi: 72, max_pixels: 100 };
        let _ = rasterizer.render(b"%PDF-1.7", 1, &settings);
        assert_eq!(bound_handle(), Some(first));
    }

    struct Fixed(u32);

    impl PageRasterizer for Fixed {
        fn page_count(&self, _pdf: &[u8]) -> Result<u32, RenderError> {
            Ok(self.0)
        }

        fn render(&self, _pdf: &[u8], _o: u32, _s: &RenderSettings) -> Result<DynamicImage, RenderError> {
            Ok(DynamicImage::new_rgb8(4, 4))
        }
    }

    #[test]
    fn structural_count_skips_page_tree_nodes() {
        let pdf = b"1 0 obj << /Type /Pages /Kids [2 0 R 3 0 R] >>\n\
                    2 0 obj << /Type /Page >>\n3 0 obj <</Type/Page/Parent 1 0 R>>";
        assert_eq!(structural_page_count(pdf), 2);
    }

    #[test]
    fn estimate_rounds_up_and_is_never_zero() {
        assert_eq!(estimated_page_count(0, 1024), 1);
        assert_eq!(estimated_page_count(1025, 1024), 2);
        assert_eq!(estimated_page_count(10, 0), 10);
    }

    #[test]
    fn scale_is_relative_to_72_dpi() {
        let s = RenderSettings { dpi: 144, max_pixels: 3000 };
        assert!((s.scale() - 2.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn parsed_count_wins() {
        let (n, source) = count_pages(Arc::new(Fixed(7)), Arc::new(b"%PDF".to_vec()), 1024).await;
        assert_eq!((n, source), (7, PageCountSource::Parsed));
    }

    #[tokio::test]
    async fn falls_back_to_structural_then_estimate() {
        let pdf = b"%PDF-1.4 << /Type /Page >> << /Type /Page >> << /Type /Page >>".to_vec();
        let (n, source) = count_pages(Arc::new(Broken), Arc::new(pdf), 1024).await;
        assert_eq!((n, source), (3, PageCountSource::Structural));

        let garbage = vec![0u8; 3000];
        let (n, source) = count_pages(Arc::new(Broken), Arc::new(garbage), 1024).await;
        assert_eq!((n, source), (3, PageCountSource::Estimated));
    }

    #[tokio::test]
    async fn render_errors_come_back_through_the_blocking_pool() {
        let err = render_page(
            Arc::new(Broken),
            Arc::new(Vec::new()),
            2,
            RenderSettings { dpi: 144, max_pixels: 3000 },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RenderError::Failed { ordinal: 2, .. }));
    }
}
