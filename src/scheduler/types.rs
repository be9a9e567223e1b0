//! Shared types for the scheduler module.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::models::{LineKind, Passage};

use super::estimator::TickOutcome;

/// Read-only projection of one monitored stop's current estimate.
/// Safe to request at any time; readers observe either the pre- or
/// post-tick snapshot, never a torn write.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StopView {
    /// Stable identifier derived from the stop name and filter
    pub stop_key: String,
    pub stop_name: String,
    /// Best current estimate for the head passage, in minutes; None until
    /// the first successful fetch
    pub display_minutes: Option<u32>,
    pub destination: Option<String>,
    pub line_kind: Option<LineKind>,
    pub line_color: Option<String>,
    pub message: Option<String>,
    /// Display icon for the head passage's line kind
    pub icon: String,
    /// Whether the most recent fetch attempt produced a usable head record
    pub available: bool,
    /// Whether display_minutes came from local decay rather than a fetch
    pub assumed: bool,
    pub initialized: bool,
    pub last_fetch_time: Option<DateTime<Utc>>,
    /// Passages after the head one
    pub next_passages: Vec<Passage>,
}

/// Broadcast notification that a stop's state changed during a poll
#[derive(Debug, Clone, Serialize)]
pub struct StopUpdate {
    pub stop_key: String,
    /// Timestamp of the poll that produced this update
    pub timestamp: String,
    pub view: StopView,
}

/// Sender for stop update notifications
pub type StopUpdateSender = broadcast::Sender<StopUpdate>;

/// Aggregate result of one poll across all monitored stops
#[derive(Debug)]
pub struct SchedulerReport {
    pub polled_at: DateTime<Utc>,
    /// True once every stop has completed its first successful fetch
    pub ready: bool,
    pub outcomes: Vec<(String, TickOutcome)>,
}

impl SchedulerReport {
    pub fn fetched_count(&self) -> usize {
        self.count(|o| matches!(o, TickOutcome::Fetched))
    }

    pub fn decayed_count(&self) -> usize {
        self.count(|o| matches!(o, TickOutcome::Decayed))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, TickOutcome::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&TickOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}
