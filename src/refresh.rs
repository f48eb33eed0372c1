//! # Full/Partial Refresh State Machine
//!
//! E-paper partial refresh is fast but every call leaves a little ghosting
//! behind, and a partial refresh issued without a valid baseline image is
//! undefined on real panels. [`RefreshController`] sits between the content
//! and the [`Panel`] and picks the primitive for each frame:
//!
//! 1. The first present after `initialize`/`clear` is a full refresh that
//!    also stores the partial baseline.
//! 2. Every `full_every_n`-th present is a full refresh (ghost clearing).
//! 3. Everything else is a partial refresh, falling back to a full refresh
//!    for that one call if the panel can't do it.
//!
//! If storing the baseline *fails* (as opposed to the panel simply not
//! having a separate baseline step), the baseline is considered missing and
//! the next present starts over with step 1.

use crate::bitmap::Bitmap;
use crate::config::RefreshConfig;
use crate::panel::{BaseOutcome, Panel, PanelError};
use log::{debug, info, warn};

/// Partial-refresh bookkeeping, owned by the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshState {
    /// A full refresh has produced a baseline usable for partial refresh
    pub base_established: bool,
    /// Presents since the baseline was (re)established, counting that one
    pub call_count: u32,
    /// Force a full refresh when `call_count` is a multiple of this (0 = never)
    pub full_every_n: u32,
}

impl RefreshState {
    pub fn new(full_every_n: u32) -> Self {
        Self {
            base_established: false,
            call_count: 0,
            full_every_n,
        }
    }

    fn reset(&mut self) {
        self.base_established = false;
        self.call_count = 0;
    }

    fn full_due(&self) -> bool {
        self.full_every_n > 0 && self.call_count % self.full_every_n == 0
    }
}

/// Which primitive [`RefreshController::present`] ended up using
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshKind {
    /// First frame after reset: full refresh that (re)establishes the baseline
    Initial,
    /// Periodic full refresh to clear ghosting
    Periodic,
    /// Fast partial refresh against the baseline
    Partial,
    /// Partial refresh unavailable or failed, full refresh instead
    Fallback,
    /// Partial refresh disabled by configuration
    Direct,
}

pub struct RefreshController<P: Panel> {
    panel: P,
    state: RefreshState,
    partial_enabled: bool,
    asleep: bool,
}

impl<P: Panel> RefreshController<P> {
    pub fn new(panel: P, config: &RefreshConfig) -> Self {
        Self {
            panel,
            state: RefreshState::new(config.full_every_n),
            partial_enabled: config.partial_enabled,
            asleep: false,
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    /// Whether the last lifecycle call put the panel into deep sleep
    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn panel_mut(&mut self) -> &mut P {
        &mut self.panel
    }

    /// Panel dimensions, for sizing rendered bitmaps
    pub fn dimensions(&self) -> (u32, u32) {
        (self.panel.width(), self.panel.height())
    }

    /// (Re)initialise the panel. The baseline is invalid afterwards either way.
    pub fn initialize(&mut self) -> Result<(), PanelError> {
        self.state.reset();
        self.asleep = false;
        self.panel.init()
    }

    /// Blank the panel. The baseline is invalid afterwards either way.
    pub fn clear(&mut self) -> Result<(), PanelError> {
        self.state.reset();
        self.panel.clear()
    }

    /// Put the panel into deep sleep. Only [`initialize`](Self::initialize)
    /// wakes it again.
    pub fn sleep_panel(&mut self) -> Result<(), PanelError> {
        self.panel.sleep()?;
        self.asleep = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), PanelError> {
        self.panel.release()
    }

    /// Show `frame`, choosing between full and partial refresh.
    ///
    /// Errors from the full-refresh path propagate; the state is left as it
    /// was before the failing call's full refresh.
    pub fn present(&mut self, frame: &Bitmap) -> Result<RefreshKind, PanelError> {
        if !self.partial_enabled {
            self.panel.display_full(frame)?;
            return Ok(RefreshKind::Direct);
        }

        if !self.state.base_established {
            debug!("Full refresh to establish partial baseline");
            self.panel.display_full(frame)?;
            self.state.call_count = 1;
            self.state.base_established = self.establish_base(frame);
            return Ok(RefreshKind::Initial);
        }

        self.state.call_count += 1;
        if self.state.full_due() {
            info!(
                "Full refresh to clear ghosting (call {})",
                self.state.call_count
            );
            self.panel.display_full(frame)?;
            self.state.base_established = self.establish_base(frame);
            return Ok(RefreshKind::Periodic);
        }

        if !self.panel.supports_partial() {
            debug!(
                "Panel has no partial refresh, full refresh (call {})",
                self.state.call_count
            );
            self.panel.display_full(frame)?;
            return Ok(RefreshKind::Fallback);
        }

        debug!("Partial refresh (call {})", self.state.call_count);
        match self.panel.display_partial(frame) {
            Ok(()) => Ok(RefreshKind::Partial),
            Err(e) => {
                warn!(
                    "Partial refresh failed (call {}): {}; falling back to full",
                    self.state.call_count, e
                );
                self.panel.display_full(frame)?;
                Ok(RefreshKind::Fallback)
            }
        }
    }

    /// Store the just-drawn frame as the partial baseline. Returns whether a
    /// usable baseline exists afterwards.
    fn establish_base(&mut self, frame: &Bitmap) -> bool {
        let outcome = if self.panel.supports_partial_base() {
            BaseOutcome::from(self.panel.establish_partial_base(frame))
        } else {
            BaseOutcome::Unsupported
        };
        match outcome {
            BaseOutcome::Established => true,
            // The full refresh itself is the reference image
            BaseOutcome::Unsupported => true,
            BaseOutcome::Failed(e) => {
                warn!("Storing partial baseline failed: {e}; next present will be full");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mock::{Call, MockPanel};

    fn controller(panel: MockPanel, full_every_n: u32) -> RefreshController<MockPanel> {
        let config = RefreshConfig {
            partial_enabled: true,
            full_every_n,
        };
        let mut ctl = RefreshController::new(panel, &config);
        ctl.initialize().unwrap();
        ctl.panel_mut().take_calls();
        ctl
    }

    fn frame() -> Bitmap {
        Bitmap::new(16, 8)
    }

    #[test]
    fn first_present_is_full_and_sets_baseline() {
        let mut ctl = controller(MockPanel::new(16, 8), 20);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Full, Call::Base]);
        let state = ctl.state();
        assert!(state.base_established);
        assert_eq!(state.call_count, 1);
    }

    #[test]
    fn subsequent_presents_are_partial() {
        let mut ctl = controller(MockPanel::new(16, 8), 20);
        ctl.present(&frame()).unwrap();
        ctl.panel_mut().take_calls();
        for _ in 0..5 {
            assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Partial);
        }
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Partial; 5]);
        assert_eq!(ctl.state().call_count, 6);
    }

    #[test]
    fn every_nth_call_is_full_without_resetting_count() {
        let mut ctl = controller(MockPanel::new(16, 8), 4);
        let kinds: Vec<RefreshKind> = (0..9).map(|_| ctl.present(&frame()).unwrap()).collect();
        use RefreshKind::*;
        assert_eq!(
            kinds,
            vec![Initial, Partial, Partial, Periodic, Partial, Partial, Partial, Periodic, Partial]
        );
        assert_eq!(ctl.state().call_count, 9);
    }

    #[test]
    fn forced_full_matches_modulo_rule_for_all_calls() {
        for n in 1..6u32 {
            let mut ctl = controller(MockPanel::new(16, 8), n);
            ctl.present(&frame()).unwrap();
            for call in 2..=30u32 {
                let kind = ctl.present(&frame()).unwrap();
                let expected = if call % n == 0 {
                    RefreshKind::Periodic
                } else {
                    RefreshKind::Partial
                };
                assert_eq!(kind, expected, "n={n} call={call}");
            }
        }
    }

    #[test]
    fn zero_cadence_never_forces_full() {
        let mut ctl = controller(MockPanel::new(16, 8), 0);
        ctl.present(&frame()).unwrap();
        for _ in 0..50 {
            assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Partial);
        }
    }

    #[test]
    fn initialize_and_clear_reset_the_baseline() {
        let mut ctl = controller(MockPanel::new(16, 8), 20);
        ctl.present(&frame()).unwrap();
        ctl.present(&frame()).unwrap();

        ctl.initialize().unwrap();
        assert_eq!(ctl.state(), RefreshState::new(20));
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);

        ctl.present(&frame()).unwrap();
        ctl.clear().unwrap();
        assert!(!ctl.state().base_established);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);
    }

    #[test]
    fn failed_partial_falls_back_to_full_once() {
        let mut panel = MockPanel::new(16, 8);
        panel.fail_partial = true;
        let mut ctl = controller(panel, 20);
        ctl.present(&frame()).unwrap();
        ctl.panel_mut().take_calls();

        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Fallback);
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Partial, Call::Full]);
        assert!(ctl.state().base_established);

        ctl.panel_mut().fail_partial = false;
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Partial);
    }

    #[test]
    fn panel_without_partial_support_gets_full_refreshes() {
        let mut panel = MockPanel::new(16, 8);
        panel.partial_supported = false;
        panel.base_supported = false;
        let mut ctl = controller(panel, 20);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Fallback);
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Full, Call::Full]);
        assert!(ctl.state().base_established);
    }

    #[test]
    fn failed_baseline_forces_full_on_next_present() {
        let mut panel = MockPanel::new(16, 8);
        panel.fail_base = true;
        let mut ctl = controller(panel, 20);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);
        assert!(!ctl.state().base_established);

        ctl.panel_mut().fail_base = false;
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Initial);
        assert!(ctl.state().base_established);
        assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Partial);
    }

    #[test]
    fn failed_full_refresh_leaves_baseline_unset() {
        let mut panel = MockPanel::new(16, 8);
        panel.fail_full = true;
        let mut ctl = controller(panel, 20);
        assert!(ctl.present(&frame()).is_err());
        assert!(!ctl.state().base_established);
        assert_eq!(ctl.state().call_count, 0);
    }

    #[test]
    fn disabled_partial_always_uses_full() {
        let config = RefreshConfig {
            partial_enabled: false,
            full_every_n: 3,
        };
        let mut ctl = RefreshController::new(MockPanel::new(16, 8), &config);
        ctl.initialize().unwrap();
        ctl.panel_mut().take_calls();
        for _ in 0..4 {
            assert_eq!(ctl.present(&frame()).unwrap(), RefreshKind::Direct);
        }
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Full; 4]);
        assert_eq!(ctl.state(), RefreshState::new(3));
    }

    #[test]
    fn sleep_and_initialize_track_the_asleep_flag() {
        let mut ctl = controller(MockPanel::new(16, 8), 20);
        assert!(!ctl.is_asleep());

        ctl.sleep_panel().unwrap();
        assert!(ctl.is_asleep());

        ctl.initialize().unwrap();
        assert!(!ctl.is_asleep());
        assert_eq!(ctl.panel_mut().take_calls(), vec![Call::Sleep, Call::Init]);
    }
}
