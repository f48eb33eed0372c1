//! # Day/Night Scheduler
//!
//! One cooperative control loop drives the kiosk. Every iteration reads the
//! civil clock, picks an [`OperatingMode`] and runs one cycle:
//!
//! - **Day**: `images_per_cycle` picture frames, each left up for the frame
//!   dwell, then one transit screen. The panel sleeps for `day_interval_secs`.
//! - **Night**: the sleeping image, then the panel sleeps for
//!   `night_interval_secs`.
//!
//! After a sleep the panel is re-initialised (which also drops the partial
//! refresh baseline) unless a shutdown was requested. No failure inside a
//! cycle ends the loop; only [`Shutdown`] does.

use crate::arrivals::ArrivalSource;
use crate::config::{Config, ScheduleConfig, TransitConfig, STOP_SLOTS};
use crate::frames::{FrameSequencer, FrameStore};
use crate::panel::{Panel, PanelError};
use crate::refresh::{RefreshController, RefreshKind};
use crate::render::{RenderError, ScreenRenderer};
use crate::StopResult;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Longest a wait runs before it looks at the shutdown flag again
pub const WAIT_SLICE: Duration = Duration::from_millis(500);

/// What the kiosk shows in a given hour
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Day,
    Night,
}

/// Night window in whole civil hours, `[start, end)`. A window with
/// `start > end` wraps midnight; `start == end` never matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NightWindow {
    pub start: u32,
    pub end: u32,
}

impl NightWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn is_night(&self, hour: u32) -> bool {
        if self.start > self.end {
            hour >= self.start || hour < self.end
        } else {
            self.start <= hour && hour < self.end
        }
    }

    pub fn mode_at(&self, hour: u32) -> OperatingMode {
        if self.is_night(hour) {
            OperatingMode::Night
        } else {
            OperatingMode::Day
        }
    }
}

impl From<&ScheduleConfig> for NightWindow {
    fn from(schedule: &ScheduleConfig) -> Self {
        Self::new(schedule.night_start_hour, schedule.night_end_hour)
    }
}

/// Wall clock in the kiosk's civil timezone
pub trait Clock {
    fn now(&self) -> DateTime<Tz>;
}

pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

/// Shared stop flag, set from the signal handler and polled by the loop
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration` in [`WAIT_SLICE`] steps. Returns `true` if
    /// shutdown was requested before or during the wait.
    pub async fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(WAIT_SLICE.min(deadline - now)).await;
        }
        true
    }
}

/// Why a piece of content could not be shown
#[derive(Error, Debug)]
enum ContentError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Panel(#[from] PanelError),
}

/// The kiosk control loop and everything it drives
pub struct Scheduler<P, R, A, C, S>
where
    P: Panel,
    R: ScreenRenderer,
    A: ArrivalSource,
    C: Clock,
    S: FrameStore,
{
    controller: RefreshController<P>,
    frames: FrameSequencer<S>,
    renderer: R,
    arrivals: A,
    clock: C,
    shutdown: Shutdown,
    schedule: ScheduleConfig,
    window: NightWindow,
    transit: TransitConfig,
    sleep_image: PathBuf,
    loop_count: u64,
}

impl<P, R, A, C, S> Scheduler<P, R, A, C, S>
where
    P: Panel,
    R: ScreenRenderer,
    A: ArrivalSource,
    C: Clock,
    S: FrameStore,
{
    pub fn new(
        controller: RefreshController<P>,
        frames: FrameSequencer<S>,
        renderer: R,
        arrivals: A,
        clock: C,
        shutdown: Shutdown,
        config: &Config,
    ) -> Self {
        Self {
            controller,
            frames,
            renderer,
            arrivals,
            clock,
            shutdown,
            schedule: config.schedule.clone(),
            window: NightWindow::from(&config.schedule),
            transit: config.transit.clone(),
            sleep_image: config.frames.sleep_image(),
            loop_count: 0,
        }
    }

    pub fn controller(&self) -> &RefreshController<P> {
        &self.controller
    }

    pub fn frames(&self) -> &FrameSequencer<S> {
        &self.frames
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn arrivals(&self) -> &A {
        &self.arrivals
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    /// Run cycles until shutdown, then blank and release the panel
    pub async fn run(&mut self) {
        while !self.shutdown.is_triggered() {
            self.run_iteration().await;
        }
        info!("Shutdown requested after {} loops", self.loop_count);
        self.teardown();
    }

    /// One pass of the control loop in whichever mode the clock selects
    pub async fn run_iteration(&mut self) -> OperatingMode {
        self.loop_count += 1;
        let started = Instant::now();
        let now = self.clock.now();
        let mode = self.window.mode_at(now.hour());
        info!("========== Loop {} ==========", self.loop_count);
        debug!("now={} hour={} mode={:?}", now, now.hour(), mode);

        match mode {
            OperatingMode::Night => self.run_night_cycle().await,
            OperatingMode::Day => self.run_day_cycle().await,
        }

        debug!(
            "Loop {} time: {:.2}s",
            self.loop_count,
            started.elapsed().as_secs_f64()
        );
        mode
    }

    pub async fn run_day_cycle(&mut self) {
        let count = self.schedule.images_per_cycle.max(1);
        let dwell = Duration::try_from_secs_f64(self.schedule.frame_dwell_secs).unwrap_or_default();
        info!("=== Image display x{} ===", count);

        for _ in 0..count {
            if self.shutdown.is_triggered() {
                break;
            }
            if self.show_next_frame() && self.shutdown.wait(dwell).await {
                break;
            }
        }

        if !self.shutdown.is_triggered() {
            info!("=== Transit display ===");
            self.show_transit().await;
        }

        self.rest(Duration::from_secs(self.schedule.day_interval_secs))
            .await;
    }

    pub async fn run_night_cycle(&mut self) {
        info!("Night window: sleep image, then panel sleep");
        self.show_sleep_image();
        self.rest(Duration::from_secs(self.schedule.night_interval_secs))
            .await;
    }

    /// Present the frame under the cursor and advance. Returns whether a
    /// frame was attempted; `false` means there was nothing to show.
    pub fn show_next_frame(&mut self) -> bool {
        if self.frames.is_empty() {
            self.frames.reload();
        }
        let Some(path) = self.frames.current().map(Path::to_path_buf) else {
            warn!("No frames to show");
            return false;
        };

        match self.present_image(&path) {
            Ok(kind) => info!("Showed {} ({:?})", path.display(), kind),
            Err(e) => error!(
                "Loop {}: frame {} failed: {}",
                self.loop_count,
                path.display(),
                e
            ),
        }
        self.frames.advance();
        true
    }

    /// Fetch every configured stop and present the transit screen.
    /// Returns whether the panel was updated.
    pub async fn show_transit(&mut self) -> bool {
        if !self.transit.has_stop_codes() {
            error!(
                "Loop {}: no stop codes configured; skipping transit screen",
                self.loop_count
            );
            return false;
        }

        let mut results = Vec::with_capacity(STOP_SLOTS);
        for slot in 0..STOP_SLOTS {
            let stop = self.transit.stops.get(slot);
            let services = match stop.and_then(|s| s.code()) {
                Some(code) => self.arrivals.fetch(code).await,
                None => Vec::new(),
            };
            let stop_name = stop.map(|s| s.name.clone()).unwrap_or_default();
            debug!("{}: {} services", stop_name, services.len());
            results.push(StopResult {
                stop_name,
                services,
            });
        }

        if results.iter().all(StopResult::is_empty) {
            info!("No arrivals at any stop; skipping transit screen");
            return false;
        }

        let (width, height) = self.controller.dimensions();
        let bitmap = self.renderer.render_transit(&results, width, height);
        match self.controller.present(&bitmap) {
            Ok(kind) => {
                info!("Transit screen shown ({:?})", kind);
                true
            }
            Err(e) => {
                error!("Loop {}: transit screen failed: {}", self.loop_count, e);
                false
            }
        }
    }

    /// Present the night image. A missing file is only a warning.
    pub fn show_sleep_image(&mut self) {
        if !self.sleep_image.exists() {
            warn!(
                "Loop {}: sleep image {} not found",
                self.loop_count,
                self.sleep_image.display()
            );
            return;
        }
        let path = self.sleep_image.clone();
        if let Err(e) = self.present_image(&path) {
            error!("Loop {}: sleep image failed: {}", self.loop_count, e);
        }
    }

    /// Final clear and release. A sleeping panel is woken first so the
    /// clear reaches it. Errors are logged and otherwise ignored.
    pub fn teardown(&mut self) {
        if self.controller.is_asleep() {
            debug!("Waking panel for the exit clear");
            if let Err(e) = self.controller.initialize() {
                warn!("Panel init on exit failed: {}", e);
            }
        }
        info!("Clearing panel before exit");
        if let Err(e) = self.controller.clear() {
            warn!("Clear on exit failed: {}", e);
        }
        if let Err(e) = self.controller.release() {
            warn!("Panel release failed: {}", e);
        }
    }

    fn present_image(&mut self, path: &Path) -> Result<RefreshKind, ContentError> {
        let (width, height) = self.controller.dimensions();
        let bitmap = self.renderer.load_image(path, width, height)?;
        Ok(self.controller.present(&bitmap)?)
    }

    /// Sleep the panel, wait, and wake it again unless shutting down.
    /// Once shutdown is seen the panel is left for teardown.
    async fn rest(&mut self, interval: Duration) {
        if self.shutdown.is_triggered() {
            return;
        }
        if let Err(e) = self.controller.sleep_panel() {
            error!("Loop {}: panel sleep failed: {}", self.loop_count, e);
        }
        info!("Waiting {}s", interval.as_secs());
        if self.shutdown.wait(interval).await {
            return;
        }
        if let Err(e) = self.controller.initialize() {
            error!("Loop {}: panel init after wait failed: {}", self.loop_count, e);
        }
    }
}
