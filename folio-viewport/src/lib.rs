use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use folio_core::{
    CancelFlag, Clock, DocumentInfo, DocumentSource, EngineConfig, PageIndex, PixelSurface,
    RenderError,
};
use folio_session::{PageLedger, ReadingSession, SessionStats};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

fn scale_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < f32::EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Unrendered,
    Rendering,
    Rendered,
    /// Rendered at an outdated scale. The old raster stays displayable
    /// until a fresh render replaces it.
    Stale,
}

struct RenderTask {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

struct RenderRecord {
    status: RenderStatus,
    scale: f32,
    generation: u64,
    surface: PixelSurface,
    in_flight: Option<RenderTask>,
}

impl RenderRecord {
    fn new() -> Self {
        Self {
            status: RenderStatus::Unrendered,
            scale: 0.0,
            generation: 0,
            surface: PixelSurface::new(),
            in_flight: None,
        }
    }

    fn has_raster(&self) -> bool {
        matches!(self.status, RenderStatus::Rendered | RenderStatus::Stale)
    }
}

struct SchedulerShared {
    source: Arc<dyn DocumentSource>,
    device_pixel_ratio: f32,
    records: Mutex<HashMap<PageIndex, RenderRecord>>,
}

/// Lazily rasterizes pages into per-page surfaces, once per (page, scale)
/// generation. At most one in-flight render exists per page; a newer
/// request cancels and replaces the older one.
pub struct RenderScheduler {
    shared: Arc<SchedulerShared>,
}

impl RenderScheduler {
    pub fn new(source: Arc<dyn DocumentSource>, device_pixel_ratio: f32) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                source,
                device_pixel_ratio,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fire-and-forget, idempotent render request.
    pub fn ensure_rendered(&self, page: PageIndex, scale: f32) {
        if !self.shared.source.info().contains_page(page) {
            warn!(page, "ignoring render request for page outside document");
            return;
        }

        let mut records = self.shared.records.lock();
        let record = records.entry(page).or_insert_with(RenderRecord::new);
        match record.status {
            RenderStatus::Rendered if scale_eq(record.scale, scale) => return,
            RenderStatus::Rendering if scale_eq(record.scale, scale) => return,
            _ => {}
        }

        // A new trigger always cancels prior in-flight work first, so
        // surfaces never receive out-of-order completions for stale scales.
        if let Some(task) = record.in_flight.take() {
            task.cancel.cancel();
            task.handle.abort();
        }

        record.generation += 1;
        record.status = RenderStatus::Rendering;
        record.scale = scale;
        let generation = record.generation;

        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let outcome = render_page(&shared, page, scale, &task_cancel).await;
            apply_completion(&shared, page, generation, outcome);
        });
        record.in_flight = Some(RenderTask { cancel, handle });
    }

    /// Marks every rendered page stale. Callers re-request visible pages
    /// afterwards; non-visible pages re-render when they next intersect.
    pub fn mark_all_stale(&self) {
        let mut records = self.shared.records.lock();
        for record in records.values_mut() {
            if record.status == RenderStatus::Rendered {
                record.status = RenderStatus::Stale;
            }
        }
    }

    pub fn status(&self, page: PageIndex) -> RenderStatus {
        self.shared
            .records
            .lock()
            .get(&page)
            .map(|record| record.status)
            .unwrap_or(RenderStatus::Unrendered)
    }

    /// Pages with a displayable raster (fresh or stale).
    pub fn rendered_pages(&self) -> BTreeSet<PageIndex> {
        self.shared
            .records
            .lock()
            .iter()
            .filter(|(_, record)| record.has_raster())
            .map(|(&page, _)| page)
            .collect()
    }

    /// Reads a page's surface without exposing ownership.
    pub fn with_surface<R>(&self, page: PageIndex, f: impl FnOnce(&PixelSurface) -> R) -> Option<R> {
        let records = self.shared.records.lock();
        records
            .get(&page)
            .filter(|record| record.has_raster())
            .map(|record| f(&record.surface))
    }

    /// Number of pages with an in-flight render task.
    pub fn in_flight_pages(&self) -> usize {
        self.shared
            .records
            .lock()
            .values()
            .filter(|record| record.in_flight.is_some())
            .count()
    }

    /// Cancels every in-flight render. Completions that still race in are
    /// discarded by the generation bump.
    pub fn cancel_all(&self) {
        let mut records = self.shared.records.lock();
        for record in records.values_mut() {
            record.generation += 1;
            if let Some(task) = record.in_flight.take() {
                task.cancel.cancel();
                task.handle.abort();
                record.status = RenderStatus::Unrendered;
            }
        }
    }

    /// Waits until no render task is in flight. Test and shutdown helper.
    pub async fn await_idle(&self) {
        while self.in_flight_pages() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[instrument(skip(shared, cancel))]
async fn render_page(
    shared: &SchedulerShared,
    page: PageIndex,
    scale: f32,
    cancel: &CancelFlag,
) -> Result<PixelSurface, RenderError> {
    cancel.bail_if_cancelled()?;
    let handle = shared.source.page(page).await?;
    cancel.bail_if_cancelled()?;

    let viewport = handle.viewport(scale);
    let (width, height) = viewport.pixel_dimensions(shared.device_pixel_ratio);
    let mut surface = PixelSurface::new();
    surface.prepare(width, height);

    handle.render_into(&mut surface, &viewport, cancel)?;
    cancel.bail_if_cancelled()?;
    Ok(surface)
}

fn apply_completion(
    shared: &SchedulerShared,
    page: PageIndex,
    generation: u64,
    outcome: Result<PixelSurface, RenderError>,
) {
    let mut records = shared.records.lock();
    let Some(record) = records.get_mut(&page) else {
        return;
    };
    if record.generation != generation {
        debug!(page, "discarding completion from a superseded render");
        return;
    }
    record.in_flight = None;
    match outcome {
        Ok(surface) => {
            record.surface = surface;
            record.status = RenderStatus::Rendered;
            debug!(page, scale = record.scale, "page rendered");
        }
        Err(err) if err.is_cancellation() => {
            record.status = RenderStatus::Unrendered;
            debug!(page, "render cancelled");
        }
        Err(err) => {
            record.status = RenderStatus::Unrendered;
            warn!(?err, page, "page render failed");
        }
    }
}

/// One intersection event for one page. Ephemeral; consumed immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityObservation {
    pub page: PageIndex,
    pub ratio: f32,
    pub intersecting: bool,
}

/// Reconciles intersection events into a single elected page, debounced so
/// fast scrolls do not thrash the external current page.
pub struct VisibilityTracker {
    quiet_window: Duration,
    ratios: BTreeMap<PageIndex, f32>,
    candidate: Option<(PageIndex, Instant)>,
    propagated: Option<PageIndex>,
}

impl VisibilityTracker {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            ratios: BTreeMap::new(),
            candidate: None,
            propagated: None,
        }
    }

    pub fn ingest(&mut self, observation: VisibilityObservation, now: Instant) {
        if observation.intersecting {
            self.ratios
                .insert(observation.page, observation.ratio.clamp(0.0, 1.0));
        } else {
            self.ratios.remove(&observation.page);
        }

        match (self.elect(), self.candidate) {
            (Some(page), Some((current, _))) if page == current => {}
            (Some(page), _) => self.candidate = Some((page, now)),
            (None, _) => self.candidate = None,
        }
    }

    /// Greatest intersection ratio wins; ties break to the smallest page.
    fn elect(&self) -> Option<PageIndex> {
        let mut best: Option<(PageIndex, f32)> = None;
        for (&page, &ratio) in &self.ratios {
            match best {
                Some((_, best_ratio)) if ratio <= best_ratio => {}
                _ => best = Some((page, ratio)),
            }
        }
        best.map(|(page, _)| page)
    }

    /// Promotes the candidate once it has stayed elected through the quiet
    /// window. While `suppressed`, elections are recorded but never
    /// propagated.
    pub fn poll(&mut self, now: Instant, suppressed: bool) -> Option<PageIndex> {
        let (page, since) = self.candidate?;
        if suppressed {
            return None;
        }
        if now.duration_since(since) < self.quiet_window {
            return None;
        }
        if self.propagated == Some(page) {
            return None;
        }
        self.propagated = Some(page);
        Some(page)
    }

    /// Records an externally imposed page so the next organic election does
    /// not re-propagate it.
    pub fn note_propagated(&mut self, page: PageIndex) {
        self.propagated = Some(page);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NavState {
    Settled,
    ProgrammaticScroll {
        target: PageIndex,
        settle_at: Instant,
    },
}

/// Arbiter between organic visibility elections and externally imposed page
/// changes. Holds the navigation lock while a programmatic scroll settles.
pub struct NavigationSync {
    settle_delay: Duration,
    state: NavState,
}

impl NavigationSync {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            state: NavState::Settled,
        }
    }

    /// Acquires (or restarts) the lock for a scroll towards `target`.
    /// Requests arriving mid-scroll retarget and restart the timer; there
    /// is no queue of intermediate targets.
    pub fn request(&mut self, target: PageIndex, now: Instant) {
        self.state = NavState::ProgrammaticScroll {
            target,
            settle_at: now + self.settle_delay,
        };
    }

    pub fn poll(&mut self, now: Instant) {
        if let NavState::ProgrammaticScroll { settle_at, .. } = self.state {
            if now >= settle_at {
                self.state = NavState::Settled;
            }
        }
    }

    pub fn lock_held(&self) -> bool {
        matches!(self.state, NavState::ProgrammaticScroll { .. })
    }

    pub fn target(&self) -> Option<PageIndex> {
        match self.state {
            NavState::ProgrammaticScroll { target, .. } => Some(target),
            NavState::Settled => None,
        }
    }
}

/// Vertical strip layout: pages stacked top to bottom with a gap, both
/// scaled by the zoom factor. This is the concrete viewport-observer
/// mechanism; it is restartable, recomputed from scratch per scroll.
pub struct PageStrip {
    heights: Vec<f32>,
    gap: f32,
}

impl PageStrip {
    pub fn new(heights: Vec<f32>, gap: f32) -> Self {
        Self {
            heights,
            gap: gap.max(0.0),
        }
    }

    pub fn uniform(page_count: usize, page_height: f32, gap: f32) -> Self {
        Self::new(vec![page_height.max(0.0); page_count], gap)
    }

    pub fn page_count(&self) -> usize {
        self.heights.len()
    }

    /// Layout offset of a page's top edge at the given scale.
    pub fn page_top(&self, page: PageIndex, scale: f32) -> f32 {
        let index = page.saturating_sub(1).min(self.heights.len());
        let mut top = 0.0;
        for height in &self.heights[..index] {
            top += height * scale + self.gap * scale;
        }
        top
    }

    pub fn total_height(&self, scale: f32) -> f32 {
        let pages: f32 = self.heights.iter().map(|h| h * scale).sum();
        let gaps = self.heights.len().saturating_sub(1) as f32 * self.gap * scale;
        pages + gaps
    }

    /// Computes one observation per page for the viewport at `scroll_top`.
    /// `prefetch_margin` extends the observed region beyond the viewport so
    /// pages start rendering before they become visible; the ratio is
    /// always measured against the viewport itself.
    pub fn observations(
        &self,
        scroll_top: f32,
        viewport_height: f32,
        scale: f32,
        prefetch_margin: f32,
    ) -> Vec<VisibilityObservation> {
        let view_top = scroll_top;
        let view_bottom = scroll_top + viewport_height.max(0.0);
        let observe_top = view_top - prefetch_margin.max(0.0);
        let observe_bottom = view_bottom + prefetch_margin.max(0.0);

        let mut out = Vec::with_capacity(self.heights.len());
        let mut top = 0.0;
        for (index, height) in self.heights.iter().enumerate() {
            let height = height * scale;
            let bottom = top + height;
            let overlap = (bottom.min(view_bottom) - top.max(view_top)).max(0.0);
            let ratio = if height > 0.0 {
                (overlap / height).clamp(0.0, 1.0)
            } else {
                0.0
            };
            out.push(VisibilityObservation {
                page: index + 1,
                ratio,
                intersecting: bottom > observe_top && top < observe_bottom,
            });
            top = bottom + self.gap * scale;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    CurrentPageChanged { page: PageIndex },
    ScrollRequested { page: PageIndex },
}

/// The viewport engine: glues the render scheduler, visibility tracker,
/// navigation arbiter and reading session behind the surface the UI layer
/// consumes.
pub struct ViewportEngine {
    source: Arc<dyn DocumentSource>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    scheduler: RenderScheduler,
    visibility: VisibilityTracker,
    navigation: NavigationSync,
    session: ReadingSession,
    scale: f32,
    current_page: PageIndex,
    events: Vec<EngineEvent>,
}

impl ViewportEngine {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        starting_page: PageIndex,
    ) -> Self {
        let page_count = source.info().page_count;
        let starting_page = starting_page.clamp(1, page_count.max(1));
        let scheduler = RenderScheduler::new(Arc::clone(&source), config.device_pixel_ratio);
        let visibility = VisibilityTracker::new(config.election_quiet_window);
        let navigation = NavigationSync::new(config.scroll_settle_delay);
        let session = ReadingSession::new(Arc::clone(&clock), starting_page);
        Self {
            source,
            clock,
            config,
            scheduler,
            visibility,
            navigation,
            session,
            scale: 1.0,
            current_page: starting_page,
            events: Vec::new(),
        }
    }

    pub fn info(&self) -> &DocumentInfo {
        self.source.info()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn current_visible_page(&self) -> PageIndex {
        self.current_page
    }

    pub fn rendered_page_indices(&self) -> BTreeSet<PageIndex> {
        self.scheduler.rendered_pages()
    }

    pub fn render_status(&self, page: PageIndex) -> RenderStatus {
        self.scheduler.status(page)
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    pub fn navigation_locked(&self) -> bool {
        self.navigation.lock_held()
    }

    /// Changes the zoom scale. Every rendered page goes stale; visible
    /// pages re-render through their next visibility observation.
    pub fn set_scale(&mut self, value: f32) {
        let value = self.config.clamp_scale(value);
        if scale_eq(value, self.scale) {
            return;
        }
        self.scale = value;
        self.scheduler.mark_all_stale();
        debug!(scale = value, "scale changed, rendered pages marked stale");
    }

    /// External navigation entry point. Locks out organic elections for the
    /// settle window and optimistically makes `page` current in the same
    /// transition, so stale intersections cannot double-fire.
    #[instrument(skip(self))]
    pub fn request_page(&mut self, page: PageIndex) {
        if !self.source.info().contains_page(page) {
            warn!(page, "ignoring navigation request outside document");
            return;
        }
        if page == self.current_page && !self.navigation.lock_held() {
            return;
        }
        let now = self.clock.now();
        self.navigation.request(page, now);
        self.events.push(EngineEvent::ScrollRequested { page });
        self.set_current(page);
    }

    /// Feeds one visibility observation: intersecting pages render lazily
    /// (pre-fetch, ratio irrelevant), and the election bookkeeping updates.
    pub fn observe(&mut self, observation: VisibilityObservation) {
        if observation.intersecting {
            self.scheduler.ensure_rendered(observation.page, self.scale);
        }
        self.visibility.ingest(observation, self.clock.now());
    }

    pub fn observe_all<I: IntoIterator<Item = VisibilityObservation>>(&mut self, observations: I) {
        for observation in observations {
            self.observe(observation);
        }
    }

    /// Drives the settle and debounce timers. Called periodically by the
    /// host loop; never mutates session state except through a settled
    /// election.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.navigation.poll(now);
        if let Some(page) = self.visibility.poll(now, self.navigation.lock_held()) {
            self.set_current(page);
        }
    }

    fn set_current(&mut self, page: PageIndex) {
        if page == self.current_page {
            return;
        }
        self.current_page = page;
        self.visibility.note_propagated(page);
        self.session.record_page_change(page);
        self.events.push(EngineEvent::CurrentPageChanged { page });
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_paused(&self) -> bool {
        self.session.is_paused()
    }

    pub fn toggle_pause(&mut self) {
        self.session.toggle_pause();
    }

    pub fn elapsed_session(&self) -> Duration {
        self.session.elapsed_session()
    }

    pub fn elapsed_current_page(&self) -> Duration {
        self.session.elapsed_current_page()
    }

    pub fn ledger(&self) -> &PageLedger {
        self.session.ledger()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Tears the engine down: cancels all in-flight renders and returns the
    /// finalized ledger for the persistence collaborator.
    pub fn close(self) -> PageLedger {
        self.scheduler.cancel_all();
        self.session.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::{Condvar, Mutex as StdMutex};

    use folio_core::{
        document_id_for_path, DocumentError, ManualClock, PageHandle, PageViewport,
    };

    struct RenderGate {
        blocked: StdMutex<bool>,
        condvar: Condvar,
    }

    impl RenderGate {
        fn new() -> Self {
            Self {
                blocked: StdMutex::new(false),
                condvar: Condvar::new(),
            }
        }

        fn block(&self) {
            *self.blocked.lock().unwrap() = true;
        }

        fn release(&self) {
            *self.blocked.lock().unwrap() = false;
            self.condvar.notify_all();
        }

        fn wait_if_blocked(&self) {
            let mut blocked = self.blocked.lock().unwrap();
            while *blocked {
                blocked = self.condvar.wait(blocked).unwrap();
            }
        }
    }

    struct FakeState {
        gate: RenderGate,
        render_counts: Mutex<HashMap<PageIndex, usize>>,
        failing_renders: Mutex<HashSet<PageIndex>>,
        failing_access: Mutex<HashSet<PageIndex>>,
    }

    struct FakeDocument {
        info: DocumentInfo,
        state: Arc<FakeState>,
    }

    impl FakeDocument {
        fn new(page_count: usize) -> Arc<Self> {
            let path = std::path::PathBuf::from("/tmp/fake.pdf");
            Arc::new(Self {
                info: DocumentInfo {
                    id: document_id_for_path(&path),
                    path,
                    page_count,
                    title: Some("fake".to_string()),
                },
                state: Arc::new(FakeState {
                    gate: RenderGate::new(),
                    render_counts: Mutex::new(HashMap::new()),
                    failing_renders: Mutex::new(HashSet::new()),
                    failing_access: Mutex::new(HashSet::new()),
                }),
            })
        }

        fn block_renders(&self) {
            self.state.gate.block();
        }

        fn release_renders(&self) {
            self.state.gate.release();
        }

        fn renders_for(&self, page: PageIndex) -> usize {
            self.state
                .render_counts
                .lock()
                .get(&page)
                .copied()
                .unwrap_or(0)
        }

        fn fail_render(&self, page: PageIndex) {
            self.state.failing_renders.lock().insert(page);
        }

        fn clear_render_failure(&self, page: PageIndex) {
            self.state.failing_renders.lock().remove(&page);
        }

        fn fail_access(&self, page: PageIndex) {
            self.state.failing_access.lock().insert(page);
        }
    }

    struct FakePage {
        state: Arc<FakeState>,
        page: PageIndex,
    }

    impl PageHandle for FakePage {
        fn viewport(&self, scale: f32) -> PageViewport {
            PageViewport::new(100.0 * scale, 140.0 * scale)
        }

        fn render_into(
            &self,
            surface: &mut PixelSurface,
            _viewport: &PageViewport,
            cancel: &CancelFlag,
        ) -> Result<(), RenderError> {
            *self.state.render_counts.lock().entry(self.page).or_insert(0) += 1;
            self.state.gate.wait_if_blocked();
            cancel.bail_if_cancelled()?;
            if self.state.failing_renders.lock().contains(&self.page) {
                return Err(RenderError::Raster("synthetic failure".into()));
            }
            if let Some(first) = surface.pixels_mut().first_mut() {
                *first = self.page as u8;
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl DocumentSource for FakeDocument {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        async fn page(&self, index: PageIndex) -> Result<Arc<dyn PageHandle>, DocumentError> {
            if !self.info.contains_page(index) {
                return Err(DocumentError::PageOutOfRange {
                    page: index,
                    page_count: self.info.page_count,
                });
            }
            if self.state.failing_access.lock().contains(&index) {
                return Err(DocumentError::Access("synthetic access failure".into()));
            }
            Ok(Arc::new(FakePage {
                state: Arc::clone(&self.state),
                page: index,
            }))
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            election_quiet_window: Duration::from_millis(150),
            scroll_settle_delay: Duration::from_millis(350),
            prefetch_margin: 50.0,
            ..EngineConfig::default()
        }
    }

    fn build_engine(
        pages: usize,
        starting_page: PageIndex,
    ) -> (Arc<FakeDocument>, Arc<ManualClock>, ViewportEngine) {
        let doc = FakeDocument::new(pages);
        let clock = Arc::new(ManualClock::new());
        let engine = ViewportEngine::new(
            doc.clone(),
            clock.clone(),
            test_config(),
            starting_page,
        );
        (doc, clock, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_rendered_is_idempotent_once_rendered() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        scheduler.ensure_rendered(1, 1.0);
        scheduler.await_idle().await;
        assert_eq!(scheduler.status(1), RenderStatus::Rendered);

        scheduler.ensure_rendered(1, 1.0);
        scheduler.ensure_rendered(1, 1.0);
        scheduler.await_idle().await;
        assert_eq!(doc.renders_for(1), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_deduplicate() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.block_renders();
        scheduler.ensure_rendered(2, 1.0);
        assert_eq!(scheduler.status(2), RenderStatus::Rendering);
        scheduler.ensure_rendered(2, 1.0);
        scheduler.ensure_rendered(2, 1.0);
        assert_eq!(scheduler.in_flight_pages(), 1);

        doc.release_renders();
        scheduler.await_idle().await;
        assert_eq!(doc.renders_for(2), 1);
        assert_eq!(scheduler.status(2), RenderStatus::Rendered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn newer_scale_supersedes_in_flight_render() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.block_renders();
        scheduler.ensure_rendered(1, 1.0);
        scheduler.ensure_rendered(1, 2.0);
        // The superseded task is cancelled and replaced, never doubled.
        assert_eq!(scheduler.in_flight_pages(), 1);

        doc.release_renders();
        scheduler.await_idle().await;
        assert_eq!(scheduler.status(1), RenderStatus::Rendered);
        // The surviving surface belongs to the scale-2 render.
        let width = scheduler.with_surface(1, |surface| surface.width()).unwrap();
        assert_eq!(width, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_in_flight_render_per_page() {
        let doc = FakeDocument::new(3);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.block_renders();
        for step in 0..5 {
            scheduler.ensure_rendered(1, 1.0 + step as f32 * 0.5);
            assert!(scheduler.in_flight_pages() <= 1);
        }
        doc.release_renders();
        scheduler.await_idle().await;
        assert_eq!(scheduler.status(1), RenderStatus::Rendered);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scale_change_marks_rendered_pages_stale_only() {
        let (doc, _clock, mut engine) = build_engine(10, 1);
        engine.scheduler().ensure_rendered(1, 1.0);
        engine.scheduler().ensure_rendered(2, 1.0);
        engine.scheduler().await_idle().await;

        engine.set_scale(2.0);
        assert_eq!(engine.render_status(1), RenderStatus::Stale);
        assert_eq!(engine.render_status(2), RenderStatus::Stale);
        assert_eq!(engine.render_status(3), RenderStatus::Unrendered);

        // Only the page that intersects again re-renders at the new scale.
        engine.observe(VisibilityObservation {
            page: 1,
            ratio: 1.0,
            intersecting: true,
        });
        engine.scheduler().await_idle().await;
        assert_eq!(engine.render_status(1), RenderStatus::Rendered);
        assert_eq!(engine.render_status(2), RenderStatus::Stale);
        assert_eq!(doc.renders_for(1), 2);
        assert_eq!(doc.renders_for(2), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn render_failure_reverts_to_unrendered_and_retries() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.fail_render(2);
        scheduler.ensure_rendered(2, 1.0);
        scheduler.await_idle().await;
        assert_eq!(scheduler.status(2), RenderStatus::Unrendered);

        doc.clear_render_failure(2);
        scheduler.ensure_rendered(2, 1.0);
        scheduler.await_idle().await;
        assert_eq!(scheduler.status(2), RenderStatus::Rendered);
        assert_eq!(doc.renders_for(2), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn document_access_failure_is_contained_to_one_page() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.fail_access(3);
        scheduler.ensure_rendered(3, 1.0);
        scheduler.ensure_rendered(4, 1.0);
        scheduler.await_idle().await;

        assert_eq!(scheduler.status(3), RenderStatus::Unrendered);
        assert_eq!(scheduler.status(4), RenderStatus::Rendered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_all_reverts_in_flight_work() {
        let doc = FakeDocument::new(5);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.block_renders();
        scheduler.ensure_rendered(1, 1.0);
        scheduler.ensure_rendered(2, 1.0);
        scheduler.cancel_all();
        assert_eq!(scheduler.in_flight_pages(), 0);

        doc.release_renders();
        // Give the cancelled tasks room to finish; their completions are
        // discarded by the generation bump.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.status(1), RenderStatus::Unrendered);
        assert_eq!(scheduler.status(2), RenderStatus::Unrendered);
        assert!(scheduler.rendered_pages().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_range_requests_are_ignored() {
        let doc = FakeDocument::new(3);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);
        scheduler.ensure_rendered(0, 1.0);
        scheduler.ensure_rendered(4, 1.0);
        scheduler.await_idle().await;
        assert!(scheduler.rendered_pages().is_empty());
    }

    #[test]
    fn election_prefers_greatest_ratio_then_smallest_page() {
        let clock = ManualClock::new();
        let mut tracker = VisibilityTracker::new(Duration::from_millis(150));
        let now = clock.now();

        for (page, ratio) in [(2, 0.5), (3, 0.5), (7, 0.2)] {
            tracker.ingest(
                VisibilityObservation {
                    page,
                    ratio,
                    intersecting: true,
                },
                now,
            );
        }
        clock.advance(Duration::from_millis(200));
        assert_eq!(tracker.poll(clock.now(), false), Some(2));
    }

    #[test]
    fn election_waits_for_the_quiet_window() {
        let clock = ManualClock::new();
        let mut tracker = VisibilityTracker::new(Duration::from_millis(150));

        tracker.ingest(
            VisibilityObservation {
                page: 4,
                ratio: 0.9,
                intersecting: true,
            },
            clock.now(),
        );
        assert_eq!(tracker.poll(clock.now(), false), None);
        clock.advance(Duration::from_millis(100));
        assert_eq!(tracker.poll(clock.now(), false), None);
        clock.advance(Duration::from_millis(60));
        assert_eq!(tracker.poll(clock.now(), false), Some(4));
        // Promoted once per quiet window, not on every poll.
        assert_eq!(tracker.poll(clock.now(), false), None);
    }

    #[test]
    fn candidate_change_restarts_the_debounce() {
        let clock = ManualClock::new();
        let mut tracker = VisibilityTracker::new(Duration::from_millis(150));

        tracker.ingest(
            VisibilityObservation {
                page: 1,
                ratio: 0.6,
                intersecting: true,
            },
            clock.now(),
        );
        clock.advance(Duration::from_millis(100));
        tracker.ingest(
            VisibilityObservation {
                page: 2,
                ratio: 0.9,
                intersecting: true,
            },
            clock.now(),
        );
        clock.advance(Duration::from_millis(100));
        // Page 2 has been the candidate for only 100ms.
        assert_eq!(tracker.poll(clock.now(), false), None);
        clock.advance(Duration::from_millis(60));
        assert_eq!(tracker.poll(clock.now(), false), Some(2));
    }

    #[test]
    fn suppressed_elections_are_recorded_not_propagated() {
        let clock = ManualClock::new();
        let mut tracker = VisibilityTracker::new(Duration::from_millis(150));

        tracker.ingest(
            VisibilityObservation {
                page: 6,
                ratio: 1.0,
                intersecting: true,
            },
            clock.now(),
        );
        clock.advance(Duration::from_millis(500));
        assert_eq!(tracker.poll(clock.now(), true), None);
        // Once the lock clears the recorded election propagates.
        assert_eq!(tracker.poll(clock.now(), false), Some(6));
    }

    #[test]
    fn navigation_lock_restarts_on_retarget() {
        let clock = ManualClock::new();
        let mut nav = NavigationSync::new(Duration::from_millis(350));

        nav.request(5, clock.now());
        assert!(nav.lock_held());
        assert_eq!(nav.target(), Some(5));

        clock.advance(Duration::from_millis(200));
        nav.poll(clock.now());
        assert!(nav.lock_held());

        nav.request(8, clock.now());
        clock.advance(Duration::from_millis(200));
        nav.poll(clock.now());
        // 400ms after the first request, but only 200ms after the retarget.
        assert!(nav.lock_held());
        assert_eq!(nav.target(), Some(8));

        clock.advance(Duration::from_millis(150));
        nav.poll(clock.now());
        assert!(!nav.lock_held());
        assert_eq!(nav.target(), None);
    }

    #[test]
    fn page_strip_layout_and_observations() {
        let strip = PageStrip::uniform(10, 100.0, 10.0);
        assert_eq!(strip.page_top(1, 1.0), 0.0);
        assert_eq!(strip.page_top(2, 1.0), 110.0);
        assert_eq!(strip.page_top(9, 1.0), 880.0);
        assert_eq!(strip.total_height(1.0), 1090.0);
        assert_eq!(strip.page_top(2, 2.0), 220.0);

        let observations = strip.observations(0.0, 250.0, 1.0, 0.0);
        assert_eq!(observations.len(), 10);
        assert!(observations[0].intersecting);
        assert_eq!(observations[0].ratio, 1.0);
        assert!(observations[1].intersecting);
        assert!(observations[2].intersecting);
        assert!((observations[2].ratio - 0.3).abs() < 1e-4);
        assert!(!observations[3].intersecting);
    }

    #[test]
    fn page_strip_prefetch_margin_extends_the_observed_region() {
        let strip = PageStrip::uniform(10, 100.0, 10.0);
        let observations = strip.observations(880.0, 250.0, 1.0, 50.0);
        // Page 8 sits just above the viewport, inside the margin.
        assert!(observations[7].intersecting);
        assert_eq!(observations[7].ratio, 0.0);
        assert!(observations[8].intersecting);
        assert!(observations[9].intersecting);
        assert!(!observations[6].intersecting);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn observations_trigger_prefetch_renders() {
        let (doc, _clock, mut engine) = build_engine(10, 1);
        engine.observe(VisibilityObservation {
            page: 2,
            ratio: 0.0,
            intersecting: true,
        });
        engine.scheduler().await_idle().await;
        assert_eq!(doc.renders_for(2), 1);
        assert_eq!(engine.render_status(2), RenderStatus::Rendered);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn organic_election_updates_current_page_and_session() {
        let (_doc, clock, mut engine) = build_engine(10, 1);

        clock.advance(Duration::from_millis(2000));
        engine.observe_all([
            VisibilityObservation {
                page: 1,
                ratio: 0.2,
                intersecting: true,
            },
            VisibilityObservation {
                page: 2,
                ratio: 0.9,
                intersecting: true,
            },
        ]);
        engine.tick();
        assert_eq!(engine.current_visible_page(), 1);

        clock.advance(Duration::from_millis(200));
        engine.tick();
        assert_eq!(engine.current_visible_page(), 2);
        assert_eq!(
            engine.drain_events(),
            vec![EngineEvent::CurrentPageChanged { page: 2 }]
        );

        // Page 1's reading time was finalized at the transition.
        let ledger = engine.ledger();
        assert_eq!(ledger.distinct_pages(), 1);
        assert_eq!(ledger.visits()[0].page, 1);
        assert_eq!(ledger.visits()[0].duration, Duration::from_millis(2200));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn navigation_lock_suppresses_foreign_elections() {
        let (_doc, clock, mut engine) = build_engine(10, 1);

        engine.request_page(9);
        assert!(engine.navigation_locked());
        assert_eq!(engine.current_visible_page(), 9);
        assert_eq!(
            engine.drain_events(),
            vec![
                EngineEvent::ScrollRequested { page: 9 },
                EngineEvent::CurrentPageChanged { page: 9 },
            ]
        );

        // Stale intersections keep arriving while the scroll is in flight.
        engine.observe(VisibilityObservation {
            page: 2,
            ratio: 1.0,
            intersecting: true,
        });
        clock.advance(Duration::from_millis(300));
        engine.tick();
        assert!(engine.navigation_locked());
        assert_eq!(engine.current_visible_page(), 9);

        // The scroll lands and the target page becomes the visible one.
        engine.observe_all([
            VisibilityObservation {
                page: 2,
                ratio: 0.0,
                intersecting: false,
            },
            VisibilityObservation {
                page: 9,
                ratio: 1.0,
                intersecting: true,
            },
        ]);
        clock.advance(Duration::from_millis(200));
        engine.tick();
        assert!(!engine.navigation_locked());
        assert_eq!(engine.current_visible_page(), 9);
        assert!(engine.drain_events().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mid_scroll_request_retargets_without_queueing() {
        let (_doc, clock, mut engine) = build_engine(20, 1);

        engine.request_page(5);
        clock.advance(Duration::from_millis(200));
        engine.tick();
        engine.request_page(8);
        assert_eq!(engine.current_visible_page(), 8);

        clock.advance(Duration::from_millis(200));
        engine.tick();
        assert!(engine.navigation_locked());

        clock.advance(Duration::from_millis(150));
        engine.tick();
        assert!(!engine.navigation_locked());
        assert_eq!(engine.current_visible_page(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn end_to_end_scroll_navigate_and_settle() {
        let (doc, clock, mut engine) = build_engine(10, 1);
        let strip = PageStrip::uniform(10, 100.0, 10.0);
        let viewport_height = 250.0;
        let margin = engine.config().prefetch_margin;

        // Initial viewport shows pages 1-3.
        engine.observe_all(strip.observations(0.0, viewport_height, 1.0, 0.0));
        engine.scheduler().await_idle().await;
        let rendered = engine.rendered_page_indices();
        assert_eq!(rendered, BTreeSet::from([1, 2, 3]));

        // Jump to page 9: lock, scroll request, optimistic current page.
        engine.request_page(9);
        let events = engine.drain_events();
        assert!(events.contains(&EngineEvent::ScrollRequested { page: 9 }));
        assert_eq!(engine.current_visible_page(), 9);

        // The UI performs the scroll; pages 8-10 enter the observed region.
        let scroll_top = strip.page_top(9, 1.0);
        engine.observe_all(strip.observations(scroll_top, viewport_height, 1.0, margin));
        engine.scheduler().await_idle().await;
        let rendered = engine.rendered_page_indices();
        for page in [8, 9, 10] {
            assert!(rendered.contains(&page), "page {page} should be rendered");
            assert_eq!(doc.renders_for(page), 1);
        }

        // The lock releases after the settle delay; no spurious election.
        clock.advance(Duration::from_millis(400));
        engine.tick();
        assert!(!engine.navigation_locked());
        assert_eq!(engine.current_visible_page(), 9);

        // Organic scrolling resumes electing.
        let scroll_top = strip.page_top(5, 1.0);
        engine.observe_all(strip.observations(scroll_top, viewport_height, 1.0, margin));
        clock.advance(Duration::from_millis(200));
        engine.tick();
        assert_eq!(engine.current_visible_page(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_finalizes_ledger_and_cancels_renders() {
        let (doc, clock, mut engine) = build_engine(10, 1);

        clock.advance(Duration::from_millis(1000));
        engine.request_page(4);
        clock.advance(Duration::from_millis(500));

        doc.block_renders();
        engine.scheduler().ensure_rendered(7, 1.0);

        let ledger = engine.close();
        doc.release_renders();
        assert_eq!(ledger.distinct_pages(), 2);
        assert_eq!(ledger.visits()[0].page, 1);
        assert_eq!(ledger.visits()[0].duration, Duration::from_millis(1000));
        assert_eq!(ledger.visits()[1].page, 4);
        assert_eq!(ledger.visits()[1].duration, Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_freezes_engine_timers() {
        let (_doc, clock, mut engine) = build_engine(10, 1);
        clock.advance(Duration::from_millis(1500));
        engine.toggle_pause();
        clock.advance(Duration::from_millis(60_000));
        assert!(engine.is_paused());
        assert_eq!(engine.elapsed_session(), Duration::from_millis(1500));
        assert_eq!(engine.elapsed_current_page(), Duration::from_millis(1500));

        engine.toggle_pause();
        clock.advance(Duration::from_millis(500));
        assert_eq!(engine.elapsed_session(), Duration::from_millis(2000));
        let stats = engine.stats();
        assert_eq!(stats.session_duration, Duration::from_millis(2000));
        assert_eq!(stats.distinct_pages_read, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn superseded_completion_never_clobbers_the_replacement() {
        let doc = FakeDocument::new(3);
        let scheduler = RenderScheduler::new(doc.clone(), 1.0);

        doc.block_renders();
        scheduler.ensure_rendered(1, 1.0);
        scheduler.ensure_rendered(1, 3.0);
        doc.release_renders();
        scheduler.await_idle().await;

        // Whatever order the two tasks finished in, the record reflects the
        // newest request.
        assert_eq!(scheduler.status(1), RenderStatus::Rendered);
        let width = scheduler.with_surface(1, |surface| surface.width()).unwrap();
        assert_eq!(width, 300);
        assert_eq!(scheduler.in_flight_pages(), 0);
    }
}
