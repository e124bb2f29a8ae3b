//! The media-server seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{ExternalRef, Item, ItemKind, ItemRef};

/// A library section on the media server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub id: String,
    pub title: String,
    pub kind: ItemKind,
}

#[derive(Debug, Error)]
pub enum MediaServerError {
    #[error("media server unreachable: {0}")]
    Unavailable(String),
    #[error("media server request timed out: {0}")]
    Timeout(String),
    #[error("media server rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected media server response: {0}")]
    Malformed(String),
}

impl MediaServerError {
    /// The server is gone; the run has to wait for it or abort
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MediaServerError::Unavailable(_))
    }
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError>;

    /// Item references of a library, most recently modified first
    async fn list_items(
        &self,
        library_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemRef>, MediaServerError>;

    /// Full payloads for the given ids. Ids the server no longer knows are omitted.
    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<Item>, MediaServerError>;

    async fn is_online(&self) -> bool;

    /// Whether the server is running one of its own library scans
    async fn is_scanning(&self) -> Result<bool, MediaServerError>;

    async fn request_refresh(&self, item_id: &str) -> Result<(), MediaServerError>;

    async fn inject_identifier(
        &self,
        item_id: &str,
        external: &ExternalRef,
    ) -> Result<(), MediaServerError>;
}
