use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use uuid::Uuid;

pub type DocumentId = Uuid;

/// 1-based page number. Page 0 is never valid.
pub type PageIndex = usize;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f1a9c6e-2b74-5d0f-8e31-9ab4c07d51e8").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub title: Option<String>,
}

impl DocumentInfo {
    pub fn contains_page(&self, page: PageIndex) -> bool {
        page >= 1 && page <= self.page_count
    }
}

/// Layout dimensions of a page at a given zoom scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageViewport {
    pub width: f32,
    pub height: f32,
}

impl PageViewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Physical pixel dimensions, scaled by the device pixel ratio.
    pub fn pixel_dimensions(&self, device_pixel_ratio: f32) -> (u32, u32) {
        let ratio = if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
            device_pixel_ratio
        } else {
            1.0
        };
        let width = (self.width * ratio).round().max(1.0);
        let height = (self.height * ratio).round().max(1.0);
        (width as u32, height as u32)
    }
}

/// RGBA8 raster target. Each surface is exclusively owned by the render
/// record that draws into it.
#[derive(Debug, Clone, Default)]
pub struct PixelSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PixelSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Resizes the buffer to the requested dimensions and clears it to
    /// transparent black.
    pub fn prepare(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        let len = width as usize * height as usize * 4;
        self.pixels.clear();
        self.pixels.resize(len, 0);
    }
}

/// Shared cancellation flag for an in-flight render. Cancelling twice, or
/// cancelling after completion, is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn bail_if_cancelled(&self) -> std::result::Result<(), RenderError> {
        if self.is_cancelled() {
            Err(RenderError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("page {page} out of range for document with {page_count} pages")]
    PageOutOfRange { page: PageIndex, page_count: usize },
    #[error("document access failed: {0}")]
    Access(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render cancelled")]
    Cancelled,
    #[error("render superseded by a newer request")]
    Superseded,
    #[error("page raster failed: {0}")]
    Raster(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl RenderError {
    /// Expected-cancellation errors are recovered silently; everything else
    /// is logged and retried on the next visibility pass.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RenderError::Cancelled | RenderError::Superseded)
    }
}

#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    async fn page(
        &self,
        index: PageIndex,
    ) -> std::result::Result<Arc<dyn PageHandle>, DocumentError>;
}

pub trait PageHandle: Send + Sync {
    fn viewport(&self, scale: f32) -> PageViewport;
    fn render_into(
        &self,
        surface: &mut PixelSurface,
        viewport: &PageViewport,
        cancel: &CancelFlag,
    ) -> std::result::Result<(), RenderError>;
}

/// Wall-clock source. Injected so session timing and settle/debounce logic
/// can be driven exactly in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and deterministic drivers.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a page must stay elected before it becomes the current page.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub election_quiet_window: Duration,
    /// How long the navigation lock is held after a programmatic scroll.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub scroll_settle_delay: Duration,
    pub device_pixel_ratio: f32,
    /// Extra layout pixels observed beyond the viewport edges so pages
    /// start rendering before they become visible.
    pub prefetch_margin: f32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            election_quiet_window: Duration::from_millis(150),
            scroll_settle_delay: Duration::from_millis(350),
            device_pixel_ratio: 1.0,
            prefetch_margin: 600.0,
            min_scale: 0.25,
            max_scale: 4.0,
        }
    }
}

impl EngineConfig {
    pub fn clamp_scale(&self, scale: f32) -> f32 {
        scale.clamp(self.min_scale, self.max_scale)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open config file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        toml::from_str(&buf).with_context(|| format!("failed to decode config file {:?}", path))
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(?err, ?path, "falling back to default engine configuration");
                Self::default()
            }
        }
    }
}

/// Accumulated active reading time for one page.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageVisit {
    pub page: PageIndex,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
}

/// Snapshot handed to the persistence collaborator when a document closes,
/// and read back for the starting page when it reopens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedReadingState {
    pub last_page: PageIndex,
    pub visits: Vec<PageVisit>,
}

impl Default for PersistedReadingState {
    fn default() -> Self {
        Self {
            last_page: 1,
            visits: Vec::new(),
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedReadingState>>;
    fn save(&self, doc: &DocumentInfo, state: &PersistedReadingState) -> Result<()>;
}

pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create session directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, doc: &DocumentInfo) -> PathBuf {
        self.root.join(format!("{}.json", doc.id))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedReadingState>> {
        let path = self.state_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open session file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode session file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedReadingState) -> Result<()> {
        let path = self.state_path(doc);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp session file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

pub struct MemorySessionStore {
    inner: Mutex<HashMap<DocumentId, PersistedReadingState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<PersistedReadingState>> {
        Ok(self.inner.lock().get(&doc.id).cloned())
    }

    fn save(&self, doc: &DocumentInfo, state: &PersistedReadingState) -> Result<()> {
        self.inner.lock().insert(doc.id, state.clone());
        Ok(())
    }
}
