//! Plex Media Server client
//!
//! Talks to the Plex HTTP API with JSON responses (`Accept: application/json`).
//! Authentication is the `X-Plex-Token` header.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::server::{Library, MediaServer, MediaServerError};
use super::{ExternalRef, Item, ItemKind, ItemRef, MetadataFields};

/// Page size for library listings
const PAGE_SIZE: usize = 1000;

/// Liveness probes use a short timeout of their own
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct PlexConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

pub struct PlexClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    container: T,
}

#[derive(Debug, Default, Deserialize)]
struct SectionContainer {
    #[serde(rename = "Directory", default)]
    directories: Vec<PlexSection>,
}

#[derive(Debug, Deserialize)]
struct PlexSection {
    key: String,
    title: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    refreshing: bool,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexMetadata>,
}

/// A listing page. Only the identity and timestamp of each entry are kept; the rest of
/// the payload is skipped while deserializing.
#[derive(Debug, Default, Deserialize)]
struct ListingContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<ListedItem>,
    #[serde(rename = "totalSize")]
    total_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ListedItem {
    #[serde(rename = "ratingKey")]
    rating_key: String,
    #[serde(rename = "updatedAt")]
    updated_at: Option<i64>,
}

impl ListedItem {
    fn into_ref(self) -> ItemRef {
        ItemRef::new(self.rating_key, timestamp(self.updated_at))
    }
}

#[derive(Debug, Deserialize)]
struct PlexMetadata {
    #[serde(rename = "ratingKey")]
    rating_key: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    title: String,
    year: Option<i32>,
    thumb: Option<String>,
    summary: Option<String>,
    rating: Option<f64>,
    #[serde(rename = "audienceRating")]
    audience_rating: Option<f64>,
    #[serde(rename = "updatedAt")]
    updated_at: Option<i64>,
    #[serde(rename = "librarySectionID")]
    library_section_id: Option<i64>,
    /// Primary agent GUID (legacy agents put the provider id here)
    guid: Option<String>,
    #[serde(rename = "Guid", default)]
    guids: Vec<PlexGuid>,
}

#[derive(Debug, Deserialize)]
struct PlexGuid {
    id: String,
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

impl PlexMetadata {
    fn into_item(self) -> Option<Item> {
        let kind = ItemKind::from_plex_type(&self.kind)?;
        let mut guids: Vec<String> = self.guids.into_iter().map(|g| g.id).collect();
        if let Some(primary) = self.guid.filter(|g| ExternalRef::parse(g).is_some()) {
            if !guids.contains(&primary) {
                guids.push(primary);
            }
        }

        Some(Item {
            id: self.rating_key,
            library_id: self
                .library_section_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            kind,
            title: self.title,
            year: self.year,
            guids,
            metadata: MetadataFields {
                poster: self.thumb,
                summary: self.summary,
                rating: self.rating.or(self.audience_rating),
            },
            updated_at: timestamp(self.updated_at),
        })
    }
}

fn classify(err: reqwest::Error) -> MediaServerError {
    if err.is_timeout() {
        MediaServerError::Timeout(err.to_string())
    } else if err.is_decode() {
        MediaServerError::Malformed(err.to_string())
    } else {
        MediaServerError::Unavailable(err.to_string())
    }
}

fn check_status(response: Response) -> Result<Response, MediaServerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(MediaServerError::Unavailable(
            format!("token rejected ({status})"),
        )),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Err(MediaServerError::Timeout(status.to_string()))
        }
        s if s.is_server_error() => Err(MediaServerError::Unavailable(s.to_string())),
        s => Err(MediaServerError::Rejected(s.to_string())),
    }
}

impl PlexClient {
    pub fn new(config: PlexConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
    }

    async fn get_json<T>(&self, request: RequestBuilder) -> Result<T, MediaServerError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.authorized(request).send().await.map_err(classify)?;
        let response = check_status(response)?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| MediaServerError::Malformed(e.to_string()))?;
        Ok(envelope.container)
    }

    async fn sections(&self) -> Result<Vec<PlexSection>, MediaServerError> {
        let container: SectionContainer = self
            .get_json(self.client.get(self.url("/library/sections")))
            .await?;
        Ok(container.directories)
    }
}

#[async_trait]
impl MediaServer for PlexClient {
    async fn list_libraries(&self) -> Result<Vec<Library>, MediaServerError> {
        let libraries = self
            .sections()
            .await?
            .into_iter()
            .filter_map(|s| {
                let kind = ItemKind::from_plex_type(&s.kind)?;
                Some(Library {
                    id: s.key,
                    title: s.title,
                    kind,
                })
            })
            .collect();
        Ok(libraries)
    }

    async fn list_items(
        &self,
        library_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ItemRef>, MediaServerError> {
        let url = self.url(&format!("/library/sections/{library_id}/all"));
        let mut refs = Vec::new();
        let mut start = 0usize;

        loop {
            let mut request = self
                .client
                .get(&url)
                .query(&[("sort", "updatedAt:desc")])
                .header("X-Plex-Container-Start", start.to_string())
                .header("X-Plex-Container-Size", PAGE_SIZE.to_string());
            if let Some(since) = since {
                request = request.query(&[("updatedAt>>", since.timestamp().to_string())]);
            }

            let page: ListingContainer = self.get_json(request).await?;
            let fetched = page.metadata.len();
            refs.extend(page.metadata.into_iter().map(ListedItem::into_ref));
            start += fetched;

            let total = page.total_size.unwrap_or(start);
            if fetched == 0 || start >= total {
                break;
            }
        }

        debug!(library = %library_id, items = refs.len(), "Listed library items");
        Ok(refs)
    }

    async fn fetch_items(&self, ids: &[String]) -> Result<Vec<Item>, MediaServerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.url(&format!("/library/metadata/{}", ids.join(",")));
        let request = self.client.get(url).query(&[("includeGuids", "1")]);
        let container: MetadataContainer = match self.get_json(request).await {
            Ok(container) => container,
            // A single deleted id turns the whole request into a 404
            Err(MediaServerError::Rejected(status)) if ids.len() == 1 => {
                debug!(item = %ids[0], %status, "Item no longer on server");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(container
            .metadata
            .into_iter()
            .filter_map(PlexMetadata::into_item)
            .collect())
    }

    async fn is_online(&self) -> bool {
        let request = self
            .client
            .get(self.url("/identity"))
            .timeout(IDENTITY_TIMEOUT);
        match self.authorized(request).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Plex identity probe failed");
                false
            }
        }
    }

    async fn is_scanning(&self) -> Result<bool, MediaServerError> {
        Ok(self.sections().await?.iter().any(|s| s.refreshing))
    }

    async fn request_refresh(&self, item_id: &str) -> Result<(), MediaServerError> {
        let url = self.url(&format!("/library/metadata/{item_id}/refresh"));
        let response = self
            .authorized(self.client.put(url))
            .send()
            .await
            .map_err(classify)?;
        check_status(response)?;
        Ok(())
    }

    async fn inject_identifier(
        &self,
        item_id: &str,
        external: &ExternalRef,
    ) -> Result<(), MediaServerError> {
        let url = self.url(&format!("/library/metadata/{item_id}/match"));
        let guid = external.to_guid();
        let response = self
            .authorized(self.client.put(url).query(&[("guid", guid.as_str())]))
            .send()
            .await
            .map_err(classify)?;

        check_status(response).inspect_err(|e| {
            warn!(item = %item_id, guid = %guid, error = %e, "Plex refused identifier");
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_into_item() {
        let json = r#"{
            "MediaContainer": {
                "totalSize": 1,
                "Metadata": [{
                    "ratingKey": "42",
                    "type": "movie",
                    "title": "Inception",
                    "year": 2010,
                    "thumb": "/library/metadata/42/thumb/1",
                    "summary": "Dreams.",
                    "audienceRating": 9.1,
                    "updatedAt": 1700000000,
                    "librarySectionID": 3,
                    "guid": "plex://movie/5d7768",
                    "Guid": [{"id": "imdb://tt1375666"}, {"id": "tmdb://27205"}]
                }]
            }
        }"#;

        let envelope: Envelope<MetadataContainer> = serde_json::from_str(json).unwrap();
        let item = envelope
            .container
            .metadata
            .into_iter()
            .next()
            .and_then(PlexMetadata::into_item)
            .unwrap();

        assert_eq!(item.id, "42");
        assert_eq!(item.library_id, "3");
        assert_eq!(item.kind, ItemKind::Movie);
        assert_eq!(item.guids, vec!["imdb://tt1375666", "tmdb://27205"]);
        assert_eq!(item.metadata.rating, Some(9.1));
        assert_eq!(item.provider_ref(), Some(ExternalRef::tmdb(27205)));
        assert_eq!(item.updated_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_listing_keeps_only_identity() {
        let json = r#"{
            "MediaContainer": {
                "totalSize": 2,
                "Metadata": [
                    {"ratingKey": "7", "updatedAt": 1700000000, "title": "Heat",
                     "summary": "A long plot summary.", "Guid": [{"id": "tmdb://949"}]},
                    {"ratingKey": "8"}
                ]
            }
        }"#;

        let envelope: Envelope<ListingContainer> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.container.total_size, Some(2));
        let refs: Vec<ItemRef> = envelope
            .container
            .metadata
            .into_iter()
            .map(ListedItem::into_ref)
            .collect();
        assert_eq!(
            refs,
            vec![
                ItemRef::new("7", timestamp(Some(1_700_000_000))),
                ItemRef::new("8", None),
            ]
        );
    }

    #[test]
    fn test_sections_parse_refreshing() {
        let json = r#"{"MediaContainer": {"Directory": [
            {"key": "1", "title": "Movies", "type": "movie", "refreshing": true},
            {"key": "2", "title": "Music", "type": "artist"}
        ]}}"#;
        let envelope: Envelope<SectionContainer> = serde_json::from_str(json).unwrap();
        let sections = envelope.container.directories;
        assert_eq!(sections.len(), 2);
        assert!(sections[0].refreshing);
        assert!(!sections[1].refreshing);
        assert_eq!(ItemKind::from_plex_type(&sections[1].kind), None);
    }
}
