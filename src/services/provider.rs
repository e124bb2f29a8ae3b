//! The metadata-provider seam

use async_trait::async_trait;
use thiserror::Error;

use super::rate_limiter::Retryable;
use crate::media::{ExternalRef, ItemKind};

/// One provider search result
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionCandidate {
    pub external: ExternalRef,
    pub title: String,
    pub year: Option<i32>,
    pub kind: ItemKind,
    /// Provider-specific relevance, only comparable within one result set
    pub relevance: f64,
    pub popularity: Option<f64>,
    /// Position in the provider's result list
    pub order: usize,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Says nothing about the item being looked up
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Malformed(_))
    }
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::RateLimited
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Search by title and optional year, in the provider's relevance order
    async fn search(
        &self,
        title: &str,
        year: Option<i32>,
        kind: ItemKind,
    ) -> Result<Vec<ResolutionCandidate>, ProviderError>;

    /// Translate a foreign identifier (IMDb, TVDB) into the provider's own
    async fn find_by_external(
        &self,
        reference: &ExternalRef,
        kind: ItemKind,
    ) -> Result<Option<ResolutionCandidate>, ProviderError>;
}
