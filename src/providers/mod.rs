pub mod stib;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{Passage, PassageFilter};

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Malformed passage record: {0}")]
    MalformedRecord(String),
}

/// STIB API request log for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ApiRequestLog {
    /// Unique request ID
    pub id: String,
    /// Timestamp when request was made
    pub timestamp: String,
    /// HTTP method (GET, POST)
    pub method: String,
    /// API endpoint called
    pub endpoint: String,
    /// Request parameters
    pub params: Option<HashMap<String, String>>,
    /// Duration of request in milliseconds
    pub duration_ms: u64,
    /// HTTP status code
    pub status: u16,
    /// Response size in bytes
    pub response_size: Option<usize>,
    /// Error message if request failed
    pub error: Option<String>,
}

/// Sender for API request diagnostics
pub type ApiRequestSender = broadcast::Sender<ApiRequestLog>;

/// Upstream collaborator contract: resolve a stop and return its upcoming
/// passages, filtered, capped and ordered soonest-first. The collaborator
/// owns the `arriving_in` computation against the supplied `now`.
pub trait PassageSource: Send + Sync + 'static {
    fn fetch_passages(
        &self,
        stop_name: &str,
        filter: &PassageFilter,
        max_passages: usize,
        lang: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Passage>, UpstreamError>> + Send;
}
