use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;

use folio_core::{
    document_id_for_path, CancelFlag, DocumentError, DocumentInfo, DocumentSource, PageHandle,
    PageIndex, PageViewport, PixelSurface, RenderError,
};
use tracing::warn;

/// Opens PDF files as engine document sources, backed by a shared pdfium
/// binding.
pub struct PdfiumSourceFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumSourceFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }

    pub fn open(&self, path: &Path) -> Result<Arc<dyn DocumentSource>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let (info, page_sizes) = inspect_document(&self.pdfium, &absolute)?;
        let shared = Arc::new(PdfiumShared {
            document: Mutex::new(None),
            pdfium: Arc::clone(&self.pdfium),
            path: absolute,
        });
        Ok(Arc::new(PdfiumSource {
            shared,
            info,
            page_sizes,
        }))
    }
}

struct PdfiumShared {
    // Declared before `pdfium`: struct fields drop in declaration order, so
    // the cached document is gone before the bindings it borrows can be.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
}

impl PdfiumShared {
    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the returned PdfDocument borrows the Pdfium bindings held
        // alive by self.pdfium. The document is only ever stored in
        // self.document, which drops before the Arc<Pdfium> field, so the
        // borrow never outlives the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }
}

struct PdfiumSource {
    shared: Arc<PdfiumShared>,
    info: DocumentInfo,
    page_sizes: Vec<PageViewport>,
}

#[async_trait]
impl DocumentSource for PdfiumSource {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    async fn page(&self, index: PageIndex) -> Result<Arc<dyn PageHandle>, DocumentError> {
        let base = self
            .page_sizes
            .get(index.wrapping_sub(1))
            .copied()
            .ok_or(DocumentError::PageOutOfRange {
                page: index,
                page_count: self.info.page_count,
            })?;
        Ok(Arc::new(PdfiumPage {
            shared: Arc::clone(&self.shared),
            index,
            base,
        }))
    }
}

struct PdfiumPage {
    shared: Arc<PdfiumShared>,
    index: PageIndex,
    base: PageViewport,
}

impl PageHandle for PdfiumPage {
    fn viewport(&self, scale: f32) -> PageViewport {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        PageViewport::new(self.base.width * scale, self.base.height * scale)
    }

    fn render_into(
        &self,
        surface: &mut PixelSurface,
        _viewport: &PageViewport,
        cancel: &CancelFlag,
    ) -> Result<(), RenderError> {
        cancel.bail_if_cancelled()?;

        // The surface was prepared to the final pixel dimensions, device
        // pixel ratio included, so the raster factor is derived from it
        // rather than from the layout scale.
        let factor = render_factor(surface.width(), self.base.width);
        let page_number = self.index;
        let pixels = self
            .shared
            .with_document(|document| {
                let page_index = PdfPageIndex::try_from(page_number.wrapping_sub(1))
                    .map_err(|_| anyhow!("page {} out of supported range", page_number))?;
                let page = document
                    .pages()
                    .get(page_index)
                    .with_context(|| format!("page {} out of range", page_number))?;
                let config = PdfRenderConfig::new().scale_page_by_factor(factor.max(0.1));
                let bitmap = page
                    .render_with_config(&config)
                    .with_context(|| format!("failed to render page {}", page_number))?;
                let image = bitmap.as_image().to_rgba8();
                Ok((image.width(), image.height(), image.into_raw()))
            })
            .map_err(|err| RenderError::Raster(err.to_string()))?;

        cancel.bail_if_cancelled()?;
        blit_rgba(surface, pixels.0, pixels.1, &pixels.2);
        Ok(())
    }
}

/// Raster scale factor that fills a surface of the given pixel width from a
/// page of the given base width in points.
fn render_factor(surface_width: u32, base_width: f32) -> f32 {
    if base_width <= 0.0 || surface_width == 0 {
        return 1.0;
    }
    surface_width as f32 / base_width
}

/// Copies an RGBA buffer into the surface, clipping to the overlapping
/// region; pdfium's rounding can differ from the prepared dimensions by a
/// pixel.
fn blit_rgba(surface: &mut PixelSurface, width: u32, height: u32, pixels: &[u8]) {
    if surface.is_empty() || width == 0 || height == 0 {
        return;
    }
    if surface.width() == width && surface.height() == height {
        surface.pixels_mut().copy_from_slice(pixels);
        return;
    }

    let copy_width = surface.width().min(width) as usize;
    let copy_height = surface.height().min(height) as usize;
    let src_stride = width as usize * 4;
    let dst_stride = surface.width() as usize * 4;
    let row_bytes = copy_width * 4;
    let dst = surface.pixels_mut();
    for row in 0..copy_height {
        let src_start = row * src_stride;
        let dst_start = row * dst_stride;
        dst[dst_start..dst_start + row_bytes]
            .copy_from_slice(&pixels[src_start..src_start + row_bytes]);
    }
}

fn inspect_document(pdfium: &Pdfium, path: &Path) -> Result<(DocumentInfo, Vec<PageViewport>)> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();

    let mut page_sizes = Vec::with_capacity(page_count);
    for page in document.pages().iter() {
        page_sizes.push(PageViewport::new(page.width().value, page.height().value));
    }

    let title = document
        .metadata()
        .get(PdfDocumentMetadataTagType::Title)
        .map(|tag| tag.value().to_owned())
        .filter(|title| !title.is_empty());

    Ok((
        DocumentInfo {
            id: document_id_for_path(path),
            path: path.to_path_buf(),
            page_count,
            title,
        },
        page_sizes,
    ))
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var("FOLIO_PDFIUM_LIBRARY_PATH") {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load pdfium from {}: {}", path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
