//! REST adapters for the authoring service: per-kind CRUD plus the
//! content-addressed resource endpoints binary assets are stored in.

pub mod content_type;
pub mod resources;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dxsync_core::{Artifact, ArtifactKind, Options, SyncError};

pub use content_type::content_type_for;
pub use resources::{AuthoringResources, ResourceHeaders, ResourceStore, ResourceUpload};
pub use rest::AuthoringApi;

pub const CRATE_NAME: &str = "dxsync-adapters";

/// Offset/limit window into a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u64,
    pub limit: u64,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl PageCursor {
    pub fn with_limit(limit: u64) -> Self {
        Self { offset: 0, limit }
    }

    /// Cursor for the page after one that returned `returned` items, or
    /// `None` when a short page marks the end of the listing.
    pub fn advance(self, returned: usize) -> Option<PageCursor> {
        if (returned as u64) < self.limit {
            None
        } else {
            Some(PageCursor {
                offset: self.offset + self.limit,
                limit: self.limit,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub modified_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Artifact>,
    pub next: Option<PageCursor>,
}

/// Remote half of an artifact kind. Implemented by [`AuthoringApi`] against
/// the live service and by test doubles in the engine tests.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    async fn list(
        &self,
        cursor: PageCursor,
        filter: ListFilter,
        opts: &Options,
    ) -> Result<Page, SyncError>;

    async fn get(&self, id: &str, opts: &Options) -> Result<Artifact, SyncError>;

    async fn create(&self, artifact: &Artifact, opts: &Options) -> Result<Artifact, SyncError>;

    async fn update(&self, artifact: &Artifact, opts: &Options) -> Result<Artifact, SyncError>;

    async fn delete(&self, artifact: &Artifact, opts: &Options) -> Result<String, SyncError>;
}
