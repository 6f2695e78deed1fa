use std::sync::Arc;
use std::time::{Duration, Instant};

use folio_core::{Clock, PageIndex, PageVisit};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wall-clock accounting for a reading session and the page currently open.
///
/// Pausing does not keep an accumulated-pause total. Instead, resuming
/// shifts `session_start` and the page marker forward by the pause
/// duration, so `elapsed = now - start` holds at every unpaused instant no
/// matter how often the session was paused in between.
pub struct SessionClock {
    clock: Arc<dyn Clock>,
    session_start: Instant,
    pause_started_at: Option<Instant>,
    current_page: PageIndex,
    marker: Instant,
}

impl SessionClock {
    pub fn new(clock: Arc<dyn Clock>, initial_page: PageIndex) -> Self {
        let now = clock.now();
        Self {
            clock,
            session_start: now,
            pause_started_at: None,
            current_page: initial_page,
            marker: now,
        }
    }

    pub fn current_page(&self) -> PageIndex {
        self.current_page
    }

    pub fn is_paused(&self) -> bool {
        self.pause_started_at.is_some()
    }

    pub fn toggle_pause(&mut self) {
        match self.pause_started_at.take() {
            Some(paused_at) => {
                let pause_duration = self.clock.now().duration_since(paused_at);
                self.session_start += pause_duration;
                self.marker += pause_duration;
            }
            None => {
                self.pause_started_at = Some(self.clock.now());
            }
        }
    }

    /// Active session time. Frozen at the pause instant while paused.
    pub fn elapsed_session(&self) -> Duration {
        match self.pause_started_at {
            Some(paused_at) => paused_at.duration_since(self.session_start),
            None => self.clock.now().duration_since(self.session_start),
        }
    }

    /// Active time on the current page. Frozen at the pause instant while
    /// paused.
    pub fn elapsed_current_page(&self) -> Duration {
        match self.pause_started_at {
            Some(paused_at) => paused_at.duration_since(self.marker),
            None => self.clock.now().duration_since(self.marker),
        }
    }

    /// Switches timing to `new_page`, returning the finalized visit for the
    /// page left behind.
    ///
    /// While paused only the page index updates: the marker is aligned to
    /// the pause instant so the resume shift lands it exactly on the resume
    /// instant, the old page gains nothing, and no wall clock is consulted
    /// across the pause boundary.
    pub fn record_page_change(&mut self, new_page: PageIndex) -> Option<PageVisit> {
        if new_page == self.current_page {
            return None;
        }
        match self.pause_started_at {
            Some(paused_at) => {
                self.current_page = new_page;
                self.marker = paused_at;
                None
            }
            None => {
                let now = self.clock.now();
                let visit = PageVisit {
                    page: self.current_page,
                    duration: now.duration_since(self.marker),
                };
                self.current_page = new_page;
                self.marker = now;
                Some(visit)
            }
        }
    }

    /// Closes the timing window of the current page without switching to
    /// another one. Used when the session ends.
    pub fn finalize_current(&mut self) -> Option<PageVisit> {
        let end = self.pause_started_at.unwrap_or_else(|| self.clock.now());
        let duration = end.duration_since(self.marker);
        self.marker = end;
        if duration.is_zero() {
            return None;
        }
        Some(PageVisit {
            page: self.current_page,
            duration,
        })
    }
}

/// Ordered, page-keyed ledger of accumulated reading durations. One entry
/// per distinct page, first-visit order preserved.
#[derive(Debug, Clone, Default)]
pub struct PageLedger {
    visits: Vec<PageVisit>,
}

impl PageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, page: PageIndex, duration: Duration) {
        match self.visits.iter_mut().find(|visit| visit.page == page) {
            Some(visit) => visit.duration += duration,
            None => self.visits.push(PageVisit { page, duration }),
        }
    }

    /// Merges previously persisted visits into this ledger.
    pub fn absorb(&mut self, visits: &[PageVisit]) {
        for visit in visits {
            self.record(visit.page, visit.duration);
        }
    }

    pub fn visits(&self) -> &[PageVisit] {
        &self.visits
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    pub fn distinct_pages(&self) -> usize {
        self.visits.len()
    }

    pub fn total_duration(&self) -> Duration {
        self.visits.iter().map(|visit| visit.duration).sum()
    }

    pub fn average_duration(&self) -> Duration {
        let pages = self.distinct_pages() as u32;
        if pages == 0 {
            return Duration::ZERO;
        }
        self.total_duration() / pages
    }
}

/// Read-only statistics derived on demand. Never cached: the live values
/// are functions of the current time, so they stay correct across
/// pause/resume without a ticking task owning them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub distinct_pages_read: usize,
    pub average_page_duration: Duration,
    pub session_duration: Duration,
    pub current_page_duration: Duration,
}

/// Session clock plus ledger, the unit the viewport engine drives.
pub struct ReadingSession {
    clock: SessionClock,
    ledger: PageLedger,
}

impl ReadingSession {
    pub fn new(clock: Arc<dyn Clock>, initial_page: PageIndex) -> Self {
        Self {
            clock: SessionClock::new(clock, initial_page),
            ledger: PageLedger::new(),
        }
    }

    pub fn current_page(&self) -> PageIndex {
        self.clock.current_page()
    }

    pub fn is_paused(&self) -> bool {
        self.clock.is_paused()
    }

    pub fn toggle_pause(&mut self) {
        self.clock.toggle_pause();
    }

    pub fn elapsed_session(&self) -> Duration {
        self.clock.elapsed_session()
    }

    pub fn elapsed_current_page(&self) -> Duration {
        self.clock.elapsed_current_page()
    }

    pub fn record_page_change(&mut self, new_page: PageIndex) {
        if let Some(visit) = self.clock.record_page_change(new_page) {
            debug!(
                page = visit.page,
                duration_ms = visit.duration.as_millis() as u64,
                "finalized page visit"
            );
            self.ledger.record(visit.page, visit.duration);
        }
    }

    pub fn ledger(&self) -> &PageLedger {
        &self.ledger
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            distinct_pages_read: self.ledger.distinct_pages(),
            average_page_duration: self.ledger.average_duration(),
            session_duration: self.elapsed_session(),
            current_page_duration: self.elapsed_current_page(),
        }
    }

    /// Flushes the open page's timing window and returns the final ledger.
    pub fn finalize(mut self) -> PageLedger {
        if let Some(visit) = self.clock.finalize_current() {
            self.ledger.record(visit.page, visit.duration);
        }
        self.ledger
    }
}
