//! Per-call options recognized across the push/pull engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SyncError;

/// Decides whether a failed push should be queued for a later pass.
pub type RetryPushFilter = Arc<dyn Fn(&SyncError) -> bool + Send + Sync>;

/// Which asset flavors an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssetScope {
    #[default]
    Both,
    WebOnly,
    ContentOnly,
}

/// Structured replacement for the opaque options bag the service clients
/// accept. Unset retry fields fall back to the HTTP client defaults.
#[derive(Clone, Default)]
pub struct Options {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub retry_min_timeout: Option<Duration>,
    pub retry_max_timeout: Option<Duration>,
    pub retry_factor: Option<f64>,
    pub retry_randomize: Option<bool>,
    pub retry_status_codes: Option<Vec<u16>>,
    pub create_only: bool,
    pub force_override: bool,
    pub publish_now: bool,
    pub asset_types: AssetScope,
    pub no_error_log: bool,
    pub since: Option<DateTime<Utc>>,
    pub ignore_timestamps: bool,
    pub tenant_base_url: Option<String>,
    pub locale: Option<String>,
    pub filter_retry_push: Option<RetryPushFilter>,
}

impl Options {
    /// Whether a failed push should be re-enqueued by the bulk driver.
    pub fn should_retry_push(&self, error: &SyncError) -> bool {
        match &self.filter_retry_push {
            Some(filter) => filter(error),
            None => false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("retry_min_timeout", &self.retry_min_timeout)
            .field("retry_max_timeout", &self.retry_max_timeout)
            .field("retry_factor", &self.retry_factor)
            .field("retry_randomize", &self.retry_randomize)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("create_only", &self.create_only)
            .field("force_override", &self.force_override)
            .field("publish_now", &self.publish_now)
            .field("asset_types", &self.asset_types)
            .field("no_error_log", &self.no_error_log)
            .field("since", &self.since)
            .field("ignore_timestamps", &self.ignore_timestamps)
            .field("tenant_base_url", &self.tenant_base_url)
            .field("locale", &self.locale)
            .field(
                "filter_retry_push",
                &self.filter_retry_push.as_ref().map(|_| "<filter>"),
            )
            .finish()
    }
}
