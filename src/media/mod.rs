//! Catalogue items as the engine sees them
//!
//! The media server owns the catalogue. The engine only holds [`ItemRef`]s for a whole
//! library and full [`Item`] payloads for one scan window at a time.

pub mod plex;
pub mod server;

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use plex::{PlexClient, PlexConfig};
pub use server::{Library, MediaServer, MediaServerError};

/// Kind of catalogue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Movie,
    Show,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Movie => "movie",
            ItemKind::Show => "show",
        }
    }

    /// Map a Plex `type` attribute to a kind. Sections of other types are ignored.
    pub fn from_plex_type(kind: &str) -> Option<Self> {
        match kind {
            "movie" => Some(ItemKind::Movie),
            "show" => Some(ItemKind::Show),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace of an external identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdSource {
    Tmdb,
    Imdb,
    Tvdb,
}

impl IdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdSource::Tmdb => "tmdb",
            IdSource::Imdb => "imdb",
            IdSource::Tvdb => "tvdb",
        }
    }
}

static IMDB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^tt\d{5,}$").expect("valid IMDb id regex"));
static NUMERIC_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9]\d*$").expect("valid id regex"));

/// An external identifier such as `tmdb://603` or `imdb://tt0133093`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    pub source: IdSource,
    pub id: String,
}

impl ExternalRef {
    pub fn new(source: IdSource, id: impl Into<String>) -> Self {
        Self {
            source,
            id: id.into(),
        }
    }

    pub fn tmdb(id: i64) -> Self {
        Self::new(IdSource::Tmdb, id.to_string())
    }

    /// Parse a Plex GUID.
    ///
    /// Accepts the modern agent form (`tmdb://603`) as well as legacy agent GUIDs
    /// (`com.plexapp.agents.themoviedb://603?lang=en`). Returns `None` for local or
    /// unknown agents.
    pub fn parse(guid: &str) -> Option<Self> {
        let (scheme, rest) = guid.split_once("://")?;
        let id = rest
            .split(['?', '/'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        let source = match scheme {
            "tmdb" | "com.plexapp.agents.themoviedb" => IdSource::Tmdb,
            "imdb" | "com.plexapp.agents.imdb" => IdSource::Imdb,
            "tvdb" | "com.plexapp.agents.thetvdb" => IdSource::Tvdb,
            _ => return None,
        };

        if id.is_empty() {
            return None;
        }
        Some(Self { source, id })
    }

    /// Whether the identifier looks like a real id for its namespace
    pub fn is_well_formed(&self) -> bool {
        match self.source {
            IdSource::Imdb => IMDB_ID.is_match(&self.id),
            IdSource::Tmdb | IdSource::Tvdb => NUMERIC_ID.is_match(&self.id),
        }
    }

    /// The GUID form the media server expects when matching
    pub fn to_guid(&self) -> String {
        format!("{}://{}", self.source.as_str(), self.id)
    }
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.source.as_str(), self.id)
    }
}

/// Identifier plus last-modified timestamp; what a library listing returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ItemRef {
    pub fn new(id: impl Into<String>, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            updated_at,
        }
    }
}

/// The metadata fields the engine checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFields {
    pub poster: Option<String>,
    pub summary: Option<String>,
    pub rating: Option<f64>,
}

/// A full catalogue entry
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub library_id: String,
    pub kind: ItemKind,
    pub title: String,
    pub year: Option<i32>,
    pub guids: Vec<String>,
    pub metadata: MetadataFields,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Item {
    /// All external identifiers the server knows for this item
    pub fn external_refs(&self) -> impl Iterator<Item = ExternalRef> + '_ {
        self.guids.iter().filter_map(|g| ExternalRef::parse(g))
    }

    /// The well-formed TMDB identifier, if the item has one. IMDb and TVDB references
    /// alone do not count: they still have to be translated through the provider.
    pub fn provider_ref(&self) -> Option<ExternalRef> {
        self.external_refs()
            .find(|r| r.source == IdSource::Tmdb && r.is_well_formed())
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.id.clone(), self.updated_at)
    }

    /// Title and year as shown in log lines
    pub fn display_title(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

/// Result of checking an item's metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataCheck {
    pub missing_identifier: bool,
    pub missing_poster: bool,
    pub missing_summary: bool,
    pub missing_rating: bool,
}

impl MetadataCheck {
    pub fn of(item: &Item) -> Self {
        let poster_ok = item
            .metadata
            .poster
            .as_deref()
            .map(str::trim)
            .is_some_and(|p| p.starts_with('/') || p.starts_with("http"));
        let summary_ok = item
            .metadata
            .summary
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        let rating_ok = item
            .metadata
            .rating
            .is_some_and(|r| r.is_finite() && (0.0..=10.0).contains(&r));

        Self {
            missing_identifier: item.provider_ref().is_none(),
            missing_poster: !poster_ok,
            missing_summary: !summary_ok,
            missing_rating: !rating_ok,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.missing_identifier && self.fields_ok()
    }

    /// Poster, summary and rating are all present
    pub fn fields_ok(&self) -> bool {
        !(self.missing_poster || self.missing_summary || self.missing_rating)
    }

    /// Comma separated list of what is missing, `-` when nothing is
    pub fn describe(&self) -> String {
        let missing: Vec<&str> = [
            (self.missing_identifier, "guid"),
            (self.missing_poster, "poster"),
            (self.missing_summary, "summary"),
            (self.missing_rating, "rating"),
        ]
        .into_iter()
        .filter_map(|(missing, name)| missing.then_some(name))
        .collect();

        if missing.is_empty() {
            "-".to_string()
        } else {
            missing.join(",")
        }
    }
}
