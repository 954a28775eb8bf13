//! Platform adapter contracts + the two scheduling-platform adapters.
//!
//! An adapter hides everything platform-specific behind three operations:
//! token lifecycle, calendar/location resolution, and fetch+normalize for a
//! date range. New platforms are additions to the registry, not edits to
//! existing adapters.

pub mod acuity;
pub mod square;

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{DateRange, NormalizedAppointment};
use tally_store::http::{ApiClient, ApiError};
use tally_store::{Store, StoreError};

pub use acuity::AcuityAdapter;
pub use square::SquareAdapter;

pub const CRATE_NAME: &str = "tally-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// No stored credential for the tenant/platform. Fatal to the pull.
    #[error("no stored connection for tenant {tenant} on {platform}")]
    ConnectionMissing { tenant: String, platform: String },
    /// The remote token endpoint rejected the refresh. Fatal to the pull.
    #[error("token refresh rejected for tenant {tenant} on {platform}: {reason}")]
    TokenRefreshFailed {
        tenant: String,
        platform: String,
        reason: String,
    },
    /// The tenant's configured calendar/location has no remote match.
    #[error("calendar {name:?} not found on {platform}")]
    CalendarNotFound { platform: String, name: String },
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("malformed {platform} response: {detail}")]
    Malformed { platform: String, detail: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Which remote resources a fetch should read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceSelector {
    /// Single-calendar platforms: one matched calendar id.
    Calendar { id: String },
    /// Multi-location platforms: selected-and-active location ids.
    Locations { ids: Vec<String> },
}

/// Result of one fetch pass. `partial` is set when a page failure truncated
/// a day/chunk; the records gathered up to that point are still usable.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub appointments: Vec<NormalizedAppointment>,
    pub pages_fetched: usize,
    pub partial: bool,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Load the stored credential; refresh and persist it when expired.
    async fn ensure_valid_token(
        &self,
        store: &dyn Store,
        tenant_id: &str,
    ) -> Result<String, AdapterError>;

    /// Resolve which remote calendar/location(s) the tenant reads.
    async fn resolve_calendars(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        token: &str,
    ) -> Result<ResourceSelector, AdapterError>;

    /// Fetch and normalize appointments for the range, future-dated records
    /// excluded, de-duplicated by external id.
    async fn fetch_appointments(
        &self,
        token: &str,
        selector: &ResourceSelector,
        range: DateRange,
    ) -> Result<FetchOutcome, AdapterError>;
}

impl fmt::Debug for dyn PlatformAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformAdapter")
            .field("platform", &self.platform())
            .finish()
    }
}

/// Registry mapping a tenant's configured platform name to an adapter.
pub fn adapter_for_platform(
    platform: &str,
    http: ApiClient,
) -> Result<Box<dyn PlatformAdapter>, AdapterError> {
    match platform.trim().to_ascii_lowercase().as_str() {
        "acuity" => Ok(Box::new(AcuityAdapter::new(http))),
        "square" => Ok(Box::new(SquareAdapter::new(http))),
        other => Err(AdapterError::UnknownPlatform(other.to_string())),
    }
}

/// Offset/limit pagination state machine. A short page terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPager {
    pub offset: usize,
    pub limit: usize,
    done: bool,
}

impl OffsetPager {
    pub fn new(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
            done: false,
        }
    }

    /// Feed the length of the page just fetched; returns true when another
    /// page should be requested.
    pub fn advance(&mut self, page_len: usize) -> bool {
        if page_len < self.limit {
            self.done = true;
        } else {
            self.offset += self.limit;
        }
        !self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Opaque-cursor pagination state machine. An absent cursor terminates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorPager {
    cursor: Option<String>,
    exhausted: bool,
}

impl CursorPager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Feed the cursor returned by the page just fetched; returns true when
    /// another page should be requested.
    pub fn advance(&mut self, next_cursor: Option<String>) -> bool {
        match next_cursor {
            Some(cursor) if !cursor.is_empty() => {
                self.cursor = Some(cursor);
                true
            }
            _ => {
                self.cursor = None;
                self.exhausted = true;
                false
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Keep the first record per external id. Chunk padding makes boundary
/// repeats routine, so this runs on every fetch result.
pub fn dedup_by_external_id(
    appointments: Vec<NormalizedAppointment>,
) -> Vec<NormalizedAppointment> {
    let mut seen: HashSet<String> = HashSet::new();
    appointments
        .into_iter()
        .filter(|appt| seen.insert(appt.external_id.clone()))
        .collect()
}
