//! # Transit Frame Core Library
//!
//! This library holds every decision the kiosk makes: which refresh mode the
//! e-paper panel gets for each frame, which content is shown when, how the
//! transit feed is retried and how its timestamps become "minutes until the
//! bus arrives". Drawing pixels and clocking bytes into the panel live behind
//! the [`render::ScreenRenderer`] and [`panel::Panel`] seams.
//!
//! ## Design Philosophy
//!
//! ### Keep Showing Something
//! The kiosk runs unattended for months. Nothing that happens inside a cycle
//! (a dead network, a corrupt frame, a panel timeout) is allowed to end the
//! control loop. Failures are logged and the offending piece of content is
//! skipped.
//!
//! ### Respect the Panel
//! - **Full refresh**: slow (several seconds), clears all ghosting
//! - **Partial refresh**: fast, but error accumulates with every call
//! - **Deep sleep**: required between cycles, and the panel must be
//!   re-initialised afterwards, which invalidates the partial baseline
//!
//! ### Data Flow
//! 1. **Schedule**: wall-clock hour → [`schedule::OperatingMode`]
//! 2. **Day**: frames from [`frames::FrameSequencer`], then arrivals from
//!    [`arrivals::ArrivalFetcher`] rendered as three stop columns
//! 3. **Night**: a single static sleeping image
//! 4. **Present**: every bitmap goes through [`refresh::RefreshController`]
//!
//! ## Core Types
//! - [`ArrivalRecord`]: the upcoming arrivals of one bus service
//! - [`StopResult`]: all services of one stop, ordered by soonest arrival

use serde::{Deserialize, Serialize};

// Module declarations
pub mod arrivals;
pub mod bitmap;
pub mod config;
pub mod frames;
pub mod panel;
pub mod refresh;
pub mod render;
pub mod schedule;

#[cfg(test)]
mod tests;

/// Upcoming arrivals of a single bus service at a stop.
///
/// `eta_minutes` holds between one and three whole-minute predictions in
/// non-decreasing order. A service whose feed entry produced no usable
/// prediction never becomes an `ArrivalRecord`.
///
/// # Example
/// ```
/// use transit_frame_lib::ArrivalRecord;
///
/// let record = ArrivalRecord {
///     service_id: "190".to_string(),
///     eta_minutes: vec![0, 7, 15],
/// };
/// assert_eq!(record.soonest(), Some(0));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    /// Service number as printed on the bus (e.g. "190", "NR7")
    pub service_id: String,
    /// Minutes until each of the next buses arrives
    pub eta_minutes: Vec<u32>,
}

impl ArrivalRecord {
    /// Minutes until the next bus of this service.
    pub fn soonest(&self) -> Option<u32> {
        self.eta_minutes.first().copied()
    }
}

/// Arrival data for one stop, ready for the renderer.
///
/// Services are ordered by their soonest ETA; ties keep the order in which
/// the feed listed them. An empty `services` list renders as an empty column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResult {
    /// Human-readable stop name shown in the column header
    pub stop_name: String,
    /// Services at this stop, soonest first
    pub services: Vec<ArrivalRecord>,
}

impl StopResult {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
