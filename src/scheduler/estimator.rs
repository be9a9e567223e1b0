//! Per-stop arrival estimation state machine.
//!
//! Each monitored stop keeps the last fetched passages plus a local estimate
//! of the head passage's countdown. On every tick the estimator either asks
//! for a fresh upstream fetch or advances the estimate locally ("decay"),
//! trading API calls against display staleness:
//!
//! - the refresh interval is capped by the configured ceiling, and shrinks
//!   to half the remaining wait as a vehicle gets close, so the countdown is
//!   re-anchored before it can lag by more than half the remaining time;
//! - a vehicle shown as "arriving now" is reconciled within ten seconds,
//!   since it may already have departed;
//! - between fetches the countdown ticks down locally in whole minutes.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::{stop_key, Passage, PassageFilter};
use crate::providers::UpstreamError;

use super::types::StopView;

/// Hard floor on the refresh interval, preventing runaway polling when the
/// remaining time is near zero
const MIN_REFRESH_SECS: i64 = 10;

/// Local decay is quantized to whole minutes to avoid jitter from
/// sub-minute polling
const DECAY_QUANTUM_SECS: i64 = 60;

/// Result of one estimator tick
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Fresh upstream data replaced the local estimate
    Fetched,
    /// The local countdown advanced without an upstream call
    Decayed,
    /// Nothing to do yet
    Unchanged,
    Failed(TickFailure),
}

#[derive(Debug, Clone, Error)]
pub enum TickFailure {
    /// Upstream answered but had no matching passage. Distinct from a hard
    /// failure for diagnostics only; the estimator state effect is the same.
    #[error("no data")]
    NoData,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Static configuration for one monitored stop
#[derive(Debug, Clone)]
pub struct StopSpec {
    pub stop_name: String,
    pub filter: PassageFilter,
    pub max_passages: usize,
    pub refresh_ceiling: Duration,
}

#[derive(Debug)]
pub struct StopEstimator {
    stop_name: String,
    key: String,
    filter: PassageFilter,
    max_passages: usize,
    refresh_ceiling: Duration,
    /// Last fetched passages, soonest first; kept stale on failure rather
    /// than blanked
    records: Vec<Passage>,
    /// Best current estimate for the head passage, possibly decayed
    state_minutes: Option<u32>,
    /// Seconds component from the last fetch; not decayed, only used for
    /// the adaptive interval
    state_seconds: Option<u32>,
    last_fetch_time: Option<DateTime<Utc>>,
    last_decay_time: Option<DateTime<Utc>>,
    initialized: bool,
    available: bool,
    assumed: bool,
}

impl StopEstimator {
    pub fn new(spec: StopSpec) -> Self {
        let key = stop_key(&spec.stop_name, &spec.filter);
        Self {
            stop_name: spec.stop_name,
            key,
            filter: spec.filter,
            max_passages: spec.max_passages,
            refresh_ceiling: spec.refresh_ceiling,
            records: Vec::new(),
            state_minutes: None,
            state_seconds: None,
            last_fetch_time: None,
            last_decay_time: None,
            initialized: false,
            available: false,
            assumed: false,
        }
    }

    pub fn stop_name(&self) -> &str {
        &self.stop_name
    }

    pub fn stop_key(&self) -> &str {
        &self.key
    }

    pub fn filter(&self) -> &PassageFilter {
        &self.filter
    }

    pub fn max_passages(&self) -> usize {
        self.max_passages
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Current refresh interval: the configured ceiling, clamped to half the
    /// remaining wait for the head passage, floored at ten seconds.
    pub fn max_delta(&self) -> Duration {
        let mut delta = self.refresh_ceiling;
        if let (Some(minutes), Some(seconds)) = (self.state_minutes, self.state_seconds) {
            let remaining = i64::from(minutes) * 60 + i64::from(seconds);
            delta = delta.min(Duration::seconds(remaining / 2));
        }
        delta.max(Duration::seconds(MIN_REFRESH_SECS))
    }

    /// Whether this tick should go upstream instead of decaying locally
    pub fn needs_fetch(&self, now: DateTime<Utc>) -> bool {
        if !self.initialized {
            return true;
        }
        let Some(last_fetch) = self.last_fetch_time else {
            return true;
        };
        let elapsed = now - last_fetch;
        if elapsed > self.max_delta() {
            return true;
        }
        // A stale "arriving now" is misleading; reconcile it quickly
        self.state_minutes == Some(0) && elapsed > Duration::seconds(MIN_REFRESH_SECS)
    }

    /// Apply a completed upstream fetch. An empty result keeps the previous
    /// records visible (transient empty answers are common near service
    /// boundaries) but marks the stop unavailable.
    pub fn record_fetch(&mut self, passages: Vec<Passage>, now: DateTime<Utc>) -> TickOutcome {
        if passages.is_empty() {
            self.available = false;
            return TickOutcome::Failed(TickFailure::NoData);
        }

        let head = &passages[0];
        self.state_minutes = Some(head.arriving_in.minutes);
        self.state_seconds = Some(head.arriving_in.seconds);
        self.records = passages;
        self.last_fetch_time = Some(now);
        self.last_decay_time = Some(now);
        self.initialized = true;
        self.available = true;
        self.assumed = false;
        TickOutcome::Fetched
    }

    /// Apply a failed upstream fetch: prior state is untouched apart from
    /// availability.
    pub fn record_failure(&mut self, error: UpstreamError) -> TickOutcome {
        self.available = false;
        TickOutcome::Failed(TickFailure::Upstream(error))
    }

    /// Advance the local countdown. Only acts once more than a minute of
    /// idle time has accumulated since the last decay.
    pub fn decay(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let Some(last_decay) = self.last_decay_time else {
            return TickOutcome::Unchanged;
        };
        let idle = now - last_decay;
        if idle <= Duration::seconds(DECAY_QUANTUM_SECS) {
            return TickOutcome::Unchanged;
        }

        self.last_decay_time = Some(now);
        let elapsed_minutes = u32::try_from(idle.num_seconds() / 60).unwrap_or(u32::MAX);
        if let Some(minutes) = self.state_minutes {
            self.state_minutes = Some(minutes.saturating_sub(elapsed_minutes));
        }
        self.assumed = true;
        TickOutcome::Decayed
    }

    /// Read-only projection of the current state
    pub fn view(&self) -> StopView {
        let head = self.records.first();
        StopView {
            stop_key: self.key.clone(),
            stop_name: self.stop_name.clone(),
            display_minutes: self.state_minutes,
            destination: head.map(|p| p.destination.clone()),
            line_kind: head.map(|p| p.line_kind),
            line_color: head.and_then(|p| p.line_color.clone()),
            message: head.and_then(|p| p.message.clone()),
            icon: head
                .map(|p| p.line_kind.icon())
                .unwrap_or("mdi:bus")
                .to_string(),
            available: self.available,
            assumed: self.assumed,
            initialized: self.initialized,
            last_fetch_time: self.last_fetch_time,
            next_passages: self.records.iter().skip(1).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArrivingIn, LineKind};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, 8, 0, 0).unwrap()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(seconds)
    }

    fn passage(minutes: u32, seconds: u32) -> Passage {
        Passage {
            destination: "STOCKEL".to_string(),
            expected_arrival_time: t0()
                + Duration::seconds(i64::from(minutes) * 60 + i64::from(seconds)),
            stop_id: "8161".to_string(),
            message: None,
            arriving_in: ArrivingIn { minutes, seconds },
            line_id: "1".to_string(),
            line_kind: LineKind::Metro,
            line_color: Some("#C4008F".to_string()),
        }
    }

    fn estimator(ceiling_secs: i64) -> StopEstimator {
        StopEstimator::new(StopSpec {
            stop_name: "De Brouckère".to_string(),
            filter: PassageFilter::default(),
            max_passages: 3,
            refresh_ceiling: Duration::seconds(ceiling_secs),
        })
    }

    #[test]
    fn test_uninitialized_estimator_always_fetches() {
        let estimator = estimator(60);
        assert!(estimator.needs_fetch(t0()));
        assert!(!estimator.initialized());
        assert!(!estimator.view().available);
    }

    #[test]
    fn test_max_delta_clamps_to_half_remaining() {
        let mut estimator = estimator(90);
        estimator.record_fetch(vec![passage(1, 0)], t0());
        // 60 seconds remaining, half is 30, under the ceiling of 90
        assert_eq!(estimator.max_delta(), Duration::seconds(30));
    }

    #[test]
    fn test_max_delta_floors_at_ten_seconds() {
        let mut estimator = estimator(90);
        estimator.record_fetch(vec![passage(0, 5)], t0());
        assert_eq!(estimator.max_delta(), Duration::seconds(10));
    }

    #[test]
    fn test_max_delta_defaults_to_ceiling() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(10, 0)], t0());
        assert_eq!(estimator.max_delta(), Duration::seconds(60));
    }

    #[test]
    fn test_no_fetch_within_interval() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(10, 0)], t0());
        assert!(!estimator.needs_fetch(at(30)));
        assert!(estimator.needs_fetch(at(61)));
    }

    #[test]
    fn test_zero_arrival_reconciles_quickly() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(0, 30)], t0());
        // max_delta is max(min(60, 15), 10) = 15, so 11s elapsed would not
        // trigger the interval rule; the zero-minutes rule fires instead
        assert!(estimator.needs_fetch(at(11)));
        assert!(!estimator.needs_fetch(at(9)));
    }

    #[test]
    fn test_fetch_reanchors_state() {
        let mut estimator = estimator(90);
        estimator.record_fetch(vec![passage(5, 12)], t0());
        estimator.decay(at(65));
        assert!(estimator.view().assumed);

        let outcome = estimator.record_fetch(vec![passage(3, 40)], at(70));
        assert!(matches!(outcome, TickOutcome::Fetched));
        let view = estimator.view();
        assert_eq!(view.display_minutes, Some(3));
        assert!(!view.assumed);
        assert!(view.available);
        assert_eq!(view.last_fetch_time, Some(at(70)));
    }

    #[test]
    fn test_decay_scenario_after_65_seconds() {
        let mut estimator = estimator(90);
        estimator.record_fetch(vec![passage(3, 0)], t0());

        // Not yet due upstream: 65 < max_delta of 90
        assert!(!estimator.needs_fetch(at(65)));

        let outcome = estimator.decay(at(65));
        assert!(matches!(outcome, TickOutcome::Decayed));
        let view = estimator.view();
        assert_eq!(view.display_minutes, Some(2));
        assert!(view.assumed);
        assert!(view.available);
    }

    #[test]
    fn test_decay_is_idempotent_under_replay() {
        let mut estimator = estimator(90);
        estimator.record_fetch(vec![passage(3, 0)], t0());
        estimator.decay(at(65));

        let outcome = estimator.decay(at(65));
        assert!(matches!(outcome, TickOutcome::Unchanged));
        assert_eq!(estimator.view().display_minutes, Some(2));
    }

    #[test]
    fn test_decay_is_quantized_to_whole_minutes() {
        let mut estimator = estimator(600);
        estimator.record_fetch(vec![passage(8, 0)], t0());
        assert!(matches!(estimator.decay(at(45)), TickOutcome::Unchanged));
        assert_eq!(estimator.view().display_minutes, Some(8));

        assert!(matches!(estimator.decay(at(61)), TickOutcome::Decayed));
        assert_eq!(estimator.view().display_minutes, Some(7));
    }

    #[test]
    fn test_decay_never_goes_negative() {
        let mut estimator = estimator(600);
        estimator.record_fetch(vec![passage(1, 0)], t0());
        let outcome = estimator.decay(at(500));
        assert!(matches!(outcome, TickOutcome::Decayed));
        assert_eq!(estimator.view().display_minutes, Some(0));
    }

    #[test]
    fn test_decay_is_monotonic_between_fetches() {
        let mut estimator = estimator(600);
        estimator.record_fetch(vec![passage(5, 0)], t0());
        let mut previous = 5;
        for seconds in [70, 140, 200, 400] {
            estimator.decay(at(seconds));
            let current = estimator.view().display_minutes.unwrap();
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_empty_fetch_keeps_stale_records() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(3, 0)], t0());

        let outcome = estimator.record_fetch(Vec::new(), at(70));
        assert!(matches!(outcome, TickOutcome::Failed(TickFailure::NoData)));
        let view = estimator.view();
        assert!(!view.available);
        assert_eq!(view.display_minutes, Some(3));
        assert_eq!(view.destination.as_deref(), Some("STOCKEL"));
        // The failed attempt does not count as a successful fetch
        assert_eq!(view.last_fetch_time, Some(t0()));
    }

    #[test]
    fn test_upstream_failure_leaves_state_untouched() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(3, 0)], t0());

        let outcome = estimator.record_failure(UpstreamError::Network("timeout".to_string()));
        assert!(matches!(
            outcome,
            TickOutcome::Failed(TickFailure::Upstream(_))
        ));
        let view = estimator.view();
        assert!(!view.available);
        assert_eq!(view.display_minutes, Some(3));
        assert!(view.initialized);
    }

    #[test]
    fn test_reaching_zero_by_decay_does_not_force_fetch_same_tick() {
        let mut estimator = estimator(600);
        estimator.record_fetch(vec![passage(4, 0)], t0());
        // Decay all the way to zero
        let outcome = estimator.decay(at(300));
        assert!(matches!(outcome, TickOutcome::Decayed));
        assert_eq!(estimator.view().display_minutes, Some(0));
        // Only the next tick picks up the zero-minutes rule (elapsed > 10s)
        assert!(estimator.needs_fetch(at(301)));
    }

    #[test]
    fn test_view_projects_head_and_next_passages() {
        let mut estimator = estimator(60);
        estimator.record_fetch(vec![passage(3, 0), passage(9, 15)], t0());
        let view = estimator.view();
        assert_eq!(view.display_minutes, Some(3));
        assert_eq!(view.icon, "mdi:subway");
        assert_eq!(view.next_passages.len(), 1);
        assert_eq!(view.next_passages[0].arriving_in.minutes, 9);
    }
}
