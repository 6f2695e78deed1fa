use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use folio_core::{
    DocumentInfo, EngineConfig, FileSessionStore, PageIndex, PersistedReadingState, SessionStore,
    SystemClock,
};
use folio_render::PdfiumSourceFactory;
use folio_session::PageLedger;
use folio_viewport::{EngineEvent, PageStrip, RenderStatus, ViewportEngine};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const PAGE_GAP: f32 = 16.0;
const LINE_SCROLL_STEP: f32 = 60.0;

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "document reading harness: lazy page rendering plus session tracking"
)]
struct Args {
    /// Page to open the document on (1-based); overrides the stored page
    #[arg(short = 'p', long = "page")]
    page: Option<PageIndex>,

    /// Viewport height in layout pixels
    #[arg(long = "viewport-height", default_value_t = 800.0)]
    viewport_height: f32,

    /// Path to the PDF file to open
    file: PathBuf,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = EngineConfig::load_or_default(&project_dirs.config_dir().join("engine.toml"));
    let store = FileSessionStore::new(project_dirs.data_local_dir().join("sessions"))?;

    let factory = PdfiumSourceFactory::new()?;
    let source = factory
        .open(&args.file)
        .with_context(|| format!("failed to open {:?}", args.file))?;
    let info = source.info().clone();
    if info.page_count == 0 {
        return Err(anyhow!("{:?} has no pages", args.file));
    }

    let persisted = store.load(&info)?.unwrap_or_default();
    let starting_page = args
        .page
        .unwrap_or(persisted.last_page)
        .clamp(1, info.page_count);

    let mut heights = Vec::with_capacity(info.page_count);
    for page in 1..=info.page_count {
        let handle = source
            .page(page)
            .await
            .map_err(|err| anyhow!("failed to inspect page {page}: {err}"))?;
        heights.push(handle.viewport(1.0).height);
    }
    let strip = PageStrip::new(heights, PAGE_GAP);

    let clock = Arc::new(SystemClock);
    let mut engine = ViewportEngine::new(source, clock, config.clone(), starting_page);

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All))?;

    let viewport_height = args.viewport_height.max(1.0);
    let mut scroll_top = strip.page_top(starting_page, engine.scale());
    let mut pending_digits = String::new();

    loop {
        engine.observe_all(strip.observations(
            scroll_top,
            viewport_height,
            engine.scale(),
            config.prefetch_margin,
        ));
        engine.tick();

        for event in engine.drain_events() {
            if let EngineEvent::ScrollRequested { page } = event {
                scroll_top = strip.page_top(page, engine.scale());
            }
        }

        draw_ui(&mut stdout, &engine, &info, &pending_digits)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    break;
                }
                let max_scroll = (strip.total_height(engine.scale()) - viewport_height).max(0.0);
                match key.code {
                    KeyCode::Char('q') => break,
                    KeyCode::Char('j') | KeyCode::Down => {
                        scroll_top = (scroll_top + LINE_SCROLL_STEP).min(max_scroll);
                    }
                    KeyCode::Char('k') | KeyCode::Up => {
                        scroll_top = (scroll_top - LINE_SCROLL_STEP).max(0.0);
                    }
                    KeyCode::Char('d') | KeyCode::PageDown => {
                        scroll_top = (scroll_top + viewport_height).min(max_scroll);
                    }
                    KeyCode::Char('u') | KeyCode::PageUp => {
                        scroll_top = (scroll_top - viewport_height).max(0.0);
                    }
                    KeyCode::Char('n') => {
                        let next = engine.current_visible_page() + 1;
                        if next <= info.page_count {
                            engine.request_page(next);
                        }
                    }
                    KeyCode::Char('p') => {
                        let current = engine.current_visible_page();
                        if current > 1 {
                            engine.request_page(current - 1);
                        }
                    }
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        engine.set_scale(engine.scale() * 1.25);
                        // Keep the current page anchored across the zoom.
                        scroll_top = strip.page_top(engine.current_visible_page(), engine.scale());
                    }
                    KeyCode::Char('-') => {
                        engine.set_scale(engine.scale() * 0.8);
                        scroll_top = strip.page_top(engine.current_visible_page(), engine.scale());
                    }
                    KeyCode::Char(' ') => engine.toggle_pause(),
                    KeyCode::Char(digit @ '0'..='9') => pending_digits.push(digit),
                    KeyCode::Enter => {
                        if let Ok(page) = pending_digits.parse::<PageIndex>() {
                            if page >= 1 && page <= info.page_count {
                                engine.request_page(page);
                            } else {
                                warn!(page, "ignoring out-of-range page input");
                            }
                        }
                        pending_digits.clear();
                    }
                    KeyCode::Esc => pending_digits.clear(),
                    _ => {}
                }
            }
        }
    }

    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;

    let last_page = engine.current_visible_page();
    let session_ledger = engine.close();
    let mut merged = PageLedger::new();
    merged.absorb(&persisted.visits);
    merged.absorb(session_ledger.visits());
    store.save(
        &info,
        &PersistedReadingState {
            last_page,
            visits: merged.visits().to_vec(),
        },
    )?;
    Ok(())
}

fn draw_ui(
    stdout: &mut io::Stdout,
    engine: &ViewportEngine,
    info: &DocumentInfo,
    pending_digits: &str,
) -> Result<()> {
    let window = terminal::window_size()?;
    let rows = window.rows.max(2);
    let map_row = rows - 2;
    let status_row = rows - 1;

    let map = format_page_map(engine, info.page_count);
    let status = format_status(engine, info, pending_digits);

    crossterm::execute!(
        stdout,
        cursor::MoveTo(0, map_row),
        Clear(ClearType::CurrentLine),
        Print(&map),
        cursor::MoveTo(0, status_row),
        Clear(ClearType::CurrentLine),
        Print(&status),
    )?;
    stdout.flush()?;
    Ok(())
}

/// One marker per page: `*` current, `#` rendered, `~` stale raster,
/// `:` rendering, `.` untouched.
fn format_page_map(engine: &ViewportEngine, page_count: usize) -> String {
    const MAX_MARKERS: usize = 80;
    let shown = page_count.min(MAX_MARKERS);
    let mut map = String::with_capacity(shown + 8);
    for page in 1..=shown {
        if page == engine.current_visible_page() {
            map.push('*');
            continue;
        }
        map.push(match engine.render_status(page) {
            RenderStatus::Rendered => '#',
            RenderStatus::Stale => '~',
            RenderStatus::Rendering => ':',
            RenderStatus::Unrendered => '.',
        });
    }
    if page_count > shown {
        map.push('…');
    }
    map
}

fn format_status(engine: &ViewportEngine, info: &DocumentInfo, pending_digits: &str) -> String {
    let name = info
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>");
    let stats = engine.stats();

    let mut status = format!(
        "{} — page {}/{} — {:.0}% — session {} — page {} — {} read, avg {}",
        name,
        engine.current_visible_page(),
        info.page_count,
        engine.scale() * 100.0,
        format_duration(stats.session_duration),
        format_duration(stats.current_page_duration),
        stats.distinct_pages_read,
        format_duration(stats.average_page_duration),
    );
    if engine.is_paused() {
        status.push_str(" — PAUSED");
    }
    if !pending_digits.is_empty() {
        status.push_str(" — goto: ");
        status.push_str(pending_digits);
    }
    status
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
