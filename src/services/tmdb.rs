//! TMDB (The Movie Database) API client
//!
//! Base URL: https://api.themoviedb.org/3
//!
//! Requests are throttled to TMDB's allowance of about 40 per 10 seconds and retried
//! on 429 and 5xx responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::provider::{MetadataProvider, ProviderError, ResolutionCandidate};
use super::rate_limiter::{RateLimitedClient, RetryPolicy, StatusClass, Throttle};
use crate::media::{ExternalRef, IdSource, ItemKind};

/// TMDB API client with rate limiting and retry logic
pub struct TmdbClient {
    client: Arc<RateLimitedClient>,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct SearchPage<T> {
    #[serde(default)]
    results: Vec<T>,
}

/// Movie search result from TMDB
#[derive(Debug, Clone, Deserialize)]
pub struct TmdbMovie {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    pub release_date: Option<String>,
    pub popularity: Option<f64>,
}

/// TV show search result from TMDB
#[derive(Debug, Clone, Deserialize)]
pub struct TmdbShow {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub first_air_date: Option<String>,
    pub popularity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FindResult {
    #[serde(default)]
    movie_results: Vec<TmdbMovie>,
    #[serde(default)]
    tv_results: Vec<TmdbShow>,
}

/// Year from a TMDB `YYYY-MM-DD` date
fn year_of(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.split('-').next())
        .and_then(|y| y.parse().ok())
}

/// TMDB returns search results best first but without a score
fn positional_relevance(order: usize) -> f64 {
    1.0 / (order as f64 + 1.0)
}

impl TmdbMovie {
    pub fn year(&self) -> Option<i32> {
        year_of(self.release_date.as_deref())
    }

    fn into_candidate(self, order: usize) -> ResolutionCandidate {
        ResolutionCandidate {
            external: ExternalRef::tmdb(self.id),
            year: self.year(),
            title: self.title,
            kind: ItemKind::Movie,
            relevance: positional_relevance(order),
            popularity: self.popularity,
            order,
        }
    }
}

impl TmdbShow {
    pub fn year(&self) -> Option<i32> {
        year_of(self.first_air_date.as_deref())
    }

    fn into_candidate(self, order: usize) -> ResolutionCandidate {
        ResolutionCandidate {
            external: ExternalRef::tmdb(self.id),
            year: self.year(),
            title: self.name,
            kind: ItemKind::Show,
            relevance: positional_relevance(order),
            popularity: self.popularity,
            order,
        }
    }
}

impl TmdbClient {
    /// Create a new TMDB client with the given API key
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Arc::new(RateLimitedClient::new(
                "tmdb",
                Throttle::TMDB,
                Duration::from_secs(10),
            )?),
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    /// Point the client at another API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Check if the client has a valid API key configured
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// GET a TMDB endpoint with retries. `Ok(None)` for a 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&'static str, String)>,
        operation: &str,
    ) -> Result<Option<T>, ProviderError> {
        if !self.has_api_key() {
            return Err(ProviderError::Unauthorized(
                "TMDB API key not configured".to_string(),
            ));
        }

        let url = format!("{}{}", self.base_url, path);
        let mut query = params;
        query.push(("api_key", self.api_key.clone()));

        self.retry
            .run(operation, || {
                let client = self.client.clone();
                let url = url.clone();
                let query = query.clone();
                async move {
                    let response = client.get(&url, &query).await?;
                    let status = response.status();

                    match StatusClass::of(status) {
                        StatusClass::Success => {}
                        StatusClass::NotFound => return Ok(None),
                        StatusClass::RateLimited => {
                            warn!("TMDB rate limit hit, will retry");
                            return Err(ProviderError::RateLimited);
                        }
                        StatusClass::Unauthorized => {
                            return Err(ProviderError::Unauthorized(
                                "TMDB API key is invalid".to_string(),
                            ));
                        }
                        StatusClass::Transient => {
                            return Err(ProviderError::Unavailable(format!("HTTP {status}")));
                        }
                        StatusClass::Rejected => {
                            return Err(ProviderError::Malformed(format!("HTTP {status}")));
                        }
                    }

                    let body: T = response
                        .json()
                        .await
                        .map_err(|e| ProviderError::Malformed(e.to_string()))?;
                    Ok(Some(body))
                }
            })
            .await
    }

    /// Search for movies by name
    pub async fn search_movies(
        &self,
        query: &str,
        year: Option<i32>,
    ) -> Result<Vec<TmdbMovie>, ProviderError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("include_adult", "false".to_string()),
        ];
        if let Some(y) = year {
            params.push(("year", y.to_string()));
        }

        let page: Option<SearchPage<TmdbMovie>> = self
            .get_json("/search/movie", params, "tmdb_search_movies")
            .await?;
        Ok(page.map(|p| p.results).unwrap_or_default())
    }

    /// Search for TV shows by name
    pub async fn search_shows(
        &self,
        query: &str,
        year: Option<i32>,
    ) -> Result<Vec<TmdbShow>, ProviderError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("include_adult", "false".to_string()),
        ];
        if let Some(y) = year {
            params.push(("first_air_date_year", y.to_string()));
        }

        let page: Option<SearchPage<TmdbShow>> = self
            .get_json("/search/tv", params, "tmdb_search_shows")
            .await?;
        Ok(page.map(|p| p.results).unwrap_or_default())
    }

    /// Verify connectivity and the API key
    pub async fn check_connection(&self) -> Result<(), ProviderError> {
        let config: Option<serde_json::Value> = self
            .get_json("/configuration", Vec::new(), "tmdb_check_connection")
            .await?;
        match config {
            Some(_) => {
                info!("TMDB reachable, API key accepted");
                Ok(())
            }
            None => Err(ProviderError::Malformed(
                "configuration endpoint not found".to_string(),
            )),
        }
    }
}

#[async_trait]
impl MetadataProvider for TmdbClient {
    fn name(&self) -> &str {
        "tmdb"
    }

    async fn search(
        &self,
        title: &str,
        year: Option<i32>,
        kind: ItemKind,
    ) -> Result<Vec<ResolutionCandidate>, ProviderError> {
        let candidates: Vec<ResolutionCandidate> = match kind {
            ItemKind::Movie => self
                .search_movies(title, year)
                .await?
                .into_iter()
                .enumerate()
                .map(|(i, m)| m.into_candidate(i))
                .collect(),
            ItemKind::Show => self
                .search_shows(title, year)
                .await?
                .into_iter()
                .enumerate()
                .map(|(i, s)| s.into_candidate(i))
                .collect(),
        };

        debug!(count = candidates.len(), %kind, "TMDB search returned results");
        Ok(candidates)
    }

    async fn find_by_external(
        &self,
        reference: &ExternalRef,
        kind: ItemKind,
    ) -> Result<Option<ResolutionCandidate>, ProviderError> {
        let source = match reference.source {
            IdSource::Imdb => "imdb_id",
            IdSource::Tvdb => "tvdb_id",
            IdSource::Tmdb => return Ok(None),
        };

        debug!(reference = %reference, "Looking up external id on TMDB");
        let found: Option<FindResult> = self
            .get_json(
                &format!("/find/{}", reference.id),
                vec![("external_source", source.to_string())],
                "tmdb_find_by_external",
            )
            .await?;

        let Some(found) = found else {
            return Ok(None);
        };
        Ok(match kind {
            ItemKind::Movie => found
                .movie_results
                .into_iter()
                .next()
                .map(|m| m.into_candidate(0)),
            ItemKind::Show => found
                .tv_results
                .into_iter()
                .next()
                .map(|s| s.into_candidate(0)),
        })
    }
}
