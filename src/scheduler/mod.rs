//! Adaptive refresh scheduling for monitored stops.
//!
//! This module handles:
//! - Per-stop fetch-vs-decay decisions (see [`estimator`])
//! - Concurrent poll fan-out with per-stop tick serialization
//! - Startup readiness aggregation and change notifications

mod estimator;
mod types;

pub use estimator::{StopEstimator, StopSpec, TickFailure, TickOutcome};
pub use types::{SchedulerReport, StopUpdate, StopUpdateSender, StopView};

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::PassageFilter;
use crate::providers::PassageSource;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("startup not ready: {initialized} of {total} stops completed their first fetch")]
    StartupNotReady { initialized: usize, total: usize },
}

/// One monitored stop: estimator state plus its tick serialization lock
struct MonitoredStop {
    stop_key: String,
    stop_name: String,
    estimator: RwLock<StopEstimator>,
    /// Serializes ticks; at most one in-flight fetch per stop
    tick_lock: Mutex<()>,
}

/// Cheap cloneable handle to one monitored stop, for the presentation layer
#[derive(Clone)]
pub struct EstimatorHandle {
    stop: Arc<MonitoredStop>,
}

impl EstimatorHandle {
    pub fn key(&self) -> &str {
        &self.stop.stop_key
    }

    pub async fn view(&self) -> StopView {
        self.stop.estimator.read().await.view()
    }
}

/// Drives poll ticks across all monitored stops, deciding per stop whether
/// to call upstream or advance the local estimate.
pub struct RefreshScheduler<S> {
    source: S,
    lang: String,
    stops: Vec<Arc<MonitoredStop>>,
    updates_tx: StopUpdateSender,
}

impl<S: PassageSource> RefreshScheduler<S> {
    pub fn new(source: S, lang: impl Into<String>) -> Self {
        // Capacity 64: clients only need the latest state per stop anyway
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            source,
            lang: lang.into(),
            stops: Vec::new(),
            updates_tx,
        }
    }

    pub fn from_config(config: &Config, source: S) -> Self {
        let mut scheduler = Self::new(source, config.lang.clone());
        for stop in &config.stops {
            let ceiling = stop
                .refresh_ceiling_secs
                .unwrap_or(config.scheduler.refresh_ceiling_secs);
            scheduler.register_stop(StopSpec {
                stop_name: stop.stop_name.clone(),
                filter: PassageFilter::new(stop.filter.clone()),
                max_passages: stop.max_passages,
                refresh_ceiling: Duration::seconds(ceiling as i64),
            });
        }
        scheduler
    }

    pub fn register_stop(&mut self, spec: StopSpec) -> EstimatorHandle {
        let estimator = StopEstimator::new(spec);
        let stop = Arc::new(MonitoredStop {
            stop_key: estimator.stop_key().to_string(),
            stop_name: estimator.stop_name().to_string(),
            estimator: RwLock::new(estimator),
            tick_lock: Mutex::new(()),
        });
        self.stops.push(stop.clone());
        EstimatorHandle { stop }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn handles(&self) -> Vec<EstimatorHandle> {
        self.stops
            .iter()
            .map(|stop| EstimatorHandle { stop: stop.clone() })
            .collect()
    }

    pub fn handle(&self, stop_key: &str) -> Option<EstimatorHandle> {
        self.stops
            .iter()
            .find(|stop| stop.stop_key == stop_key)
            .map(|stop| EstimatorHandle { stop: stop.clone() })
    }

    /// Get the stop updates sender for passing to API handlers
    pub fn updates_sender(&self) -> StopUpdateSender {
        self.updates_tx.clone()
    }

    /// Run one poll tick across all stops. Fetches fan out concurrently;
    /// ordering between stops carries no guarantee.
    pub async fn poll(&self, now: DateTime<Utc>) -> SchedulerReport {
        let ticks = self.stops.iter().map(|stop| self.tick_stop(stop, now));
        let outcomes = futures::future::join_all(ticks).await;

        let mut ready = true;
        for stop in &self.stops {
            if !stop.estimator.read().await.initialized() {
                ready = false;
                break;
            }
        }

        for (stop, (_, outcome)) in self.stops.iter().zip(&outcomes) {
            if matches!(outcome, TickOutcome::Unchanged) {
                continue;
            }
            let view = stop.estimator.read().await.view();
            // Send errors just mean no one is listening
            let _ = self.updates_tx.send(StopUpdate {
                stop_key: stop.stop_key.clone(),
                timestamp: now.to_rfc3339(),
                view,
            });
        }

        let report = SchedulerReport {
            polled_at: now,
            ready,
            outcomes,
        };
        info!(
            polled_at = %report.polled_at,
            fetched = report.fetched_count(),
            decayed = report.decayed_count(),
            failed = report.failed_count(),
            ready = report.ready,
            "Completed poll"
        );
        report
    }

    /// Run the first poll and fail unless every stop initialized. Callers
    /// own the retry policy around this.
    pub async fn initialize(&self, now: DateTime<Utc>) -> Result<SchedulerReport, SchedulerError> {
        let report = self.poll(now).await;
        if report.ready {
            return Ok(report);
        }
        let mut initialized = 0;
        for stop in &self.stops {
            if stop.estimator.read().await.initialized() {
                initialized += 1;
            }
        }
        Err(SchedulerError::StartupNotReady {
            initialized,
            total: self.stops.len(),
        })
    }

    async fn tick_stop(&self, stop: &Arc<MonitoredStop>, now: DateTime<Utc>) -> (String, TickOutcome) {
        let _tick = stop.tick_lock.lock().await;

        // Decide under a short read lock; the fetch itself runs without
        // holding the state lock so readers are never blocked on I/O
        let (wants_fetch, filter, max_passages) = {
            let estimator = stop.estimator.read().await;
            (
                estimator.needs_fetch(now),
                estimator.filter().clone(),
                estimator.max_passages(),
            )
        };

        let outcome = if wants_fetch {
            match self
                .source
                .fetch_passages(&stop.stop_name, &filter, max_passages, &self.lang, now)
                .await
            {
                Ok(passages) => stop.estimator.write().await.record_fetch(passages, now),
                Err(e) => stop.estimator.write().await.record_failure(e),
            }
        } else {
            stop.estimator.write().await.decay(now)
        };

        match &outcome {
            TickOutcome::Fetched => debug!(stop = %stop.stop_key, "Refreshed from upstream"),
            TickOutcome::Decayed => debug!(stop = %stop.stop_key, "Advanced local estimate"),
            TickOutcome::Unchanged => {}
            TickOutcome::Failed(TickFailure::NoData) => {
                warn!(stop = %stop.stop_key, "No matching passages from upstream, keeping existing data");
            }
            TickOutcome::Failed(TickFailure::Upstream(e)) => {
                warn!(stop = %stop.stop_key, error = %e, "Upstream fetch failed, keeping existing data");
            }
        }

        (stop.stop_key.clone(), outcome)
    }
}
