//! Title/year resolution against the metadata provider
//!
//! ## Scoring Formula
//! ```text
//! score = 0.60 × title_similarity
//!       + 0.25 (same year) | 0.15 (year ±1) | 0 (year unknown)
//!       + 0.10 × relevance / best relevance in the result set
//! ```
//!
//! Candidates of another kind, more than a year apart, or with a title similarity below
//! 0.80 are dropped before scoring. The best candidate wins only if its score exceeds the
//! acceptance threshold.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use super::logging::{LogSinks, Sink};
use super::provider::{MetadataProvider, ProviderError, ResolutionCandidate};
use super::text_utils::{clean_bidi, normalize, title_similarity};
use crate::media::{IdSource, Item, ItemKind};

/// Scoring weights (total = 1.0)
pub mod weights {
    pub const TITLE: f64 = 0.60;
    pub const YEAR_EXACT: f64 = 0.25;
    pub const YEAR_ADJACENT: f64 = 0.15;
    pub const RELEVANCE: f64 = 0.10;
    /// Candidates below this title similarity are never considered
    pub const MIN_TITLE_SIMILARITY: f64 = 0.80;
}

pub const DEFAULT_ACCEPTANCE_THRESHOLD: f64 = 0.55;

/// Scores closer than this are ties
const SCORE_EPSILON: f64 = 1e-9;

/// How each part contributed to a candidate's score
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub title_similarity: f64,
    pub title: f64,
    pub year: f64,
    pub relevance: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    /// Create a human-readable summary of the scoring
    pub fn summary(&self) -> String {
        format!(
            "total:{:.3} [title:{:.0}%→{:.3}, year:{:.2}, relevance:{:.3}]",
            self.total,
            self.title_similarity * 100.0,
            self.title,
            self.year,
            self.relevance
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: ResolutionCandidate,
    pub breakdown: ScoreBreakdown,
    pub exact_year: bool,
}

impl ScoredCandidate {
    pub fn score(&self) -> f64 {
        self.breakdown.total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Match(ScoredCandidate),
    NoMatch { best_score: Option<f64> },
}

/// Score one candidate, or `None` when it is disqualified
pub fn score_candidate(
    title: &str,
    year: Option<i32>,
    kind: ItemKind,
    candidate: &ResolutionCandidate,
    best_relevance: f64,
) -> Option<ScoredCandidate> {
    if candidate.kind != kind {
        return None;
    }

    let year_delta = year.zip(candidate.year).map(|(a, b)| (a - b).abs());
    let year_score = match year_delta {
        Some(0) => weights::YEAR_EXACT,
        Some(1) => weights::YEAR_ADJACENT,
        Some(_) => return None,
        None => 0.0,
    };

    let similarity = title_similarity(title, &candidate.title);
    if similarity < weights::MIN_TITLE_SIMILARITY {
        return None;
    }

    let relevance = if best_relevance > 0.0 {
        (candidate.relevance / best_relevance).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let title_score = weights::TITLE * similarity;
    let relevance_score = weights::RELEVANCE * relevance;
    Some(ScoredCandidate {
        candidate: candidate.clone(),
        breakdown: ScoreBreakdown {
            title_similarity: similarity,
            title: title_score,
            year: year_score,
            relevance: relevance_score,
            total: title_score + year_score + relevance_score,
        },
        exact_year: year_delta == Some(0),
    })
}

/// Whether `a` should be preferred over `b`
fn outranks(a: &ScoredCandidate, b: &ScoredCandidate) -> bool {
    let diff = a.score() - b.score();
    if diff.abs() > SCORE_EPSILON {
        return diff > 0.0;
    }
    if a.exact_year != b.exact_year {
        return a.exact_year;
    }
    let pop_a = a.candidate.popularity.unwrap_or(0.0);
    let pop_b = b.candidate.popularity.unwrap_or(0.0);
    if (pop_a - pop_b).abs() > SCORE_EPSILON {
        return pop_a > pop_b;
    }
    a.candidate.order < b.candidate.order
}

/// Pick the best candidate for a query, if any clears the threshold
pub fn pick_best(
    title: &str,
    year: Option<i32>,
    kind: ItemKind,
    candidates: &[ResolutionCandidate],
    threshold: f64,
) -> Resolution {
    let best_relevance = candidates
        .iter()
        .map(|c| c.relevance)
        .fold(0.0_f64, f64::max);

    let best = candidates
        .iter()
        .filter_map(|c| score_candidate(title, year, kind, c, best_relevance))
        .reduce(|best, next| if outranks(&next, &best) { next } else { best });

    match best {
        Some(best) if best.score() > threshold => Resolution::Match(best),
        Some(best) => Resolution::NoMatch {
            best_score: Some(best.score()),
        },
        None => Resolution::NoMatch { best_score: None },
    }
}

/// Lookup counters for the run report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub tries: u64,
    pub hits: u64,
}

impl ResolverStats {
    pub fn hit_rate(&self) -> Option<f64> {
        (self.tries > 0).then(|| self.hits as f64 / self.tries as f64)
    }
}

pub struct Resolver {
    provider: Arc<dyn MetadataProvider>,
    sinks: Arc<LogSinks>,
    threshold: f64,
    tries: AtomicU64,
    hits: AtomicU64,
}

impl Resolver {
    pub fn new(provider: Arc<dyn MetadataProvider>, sinks: Arc<LogSinks>, threshold: f64) -> Self {
        Self {
            provider,
            sinks,
            threshold,
            tries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Resolve a normalized title to a provider identifier
    pub async fn resolve(
        &self,
        title: &str,
        year: Option<i32>,
        kind: ItemKind,
    ) -> Result<Resolution, ProviderError> {
        self.tries.fetch_add(1, Ordering::Relaxed);

        let candidates = match self.provider.search(title, year, kind).await {
            Ok(candidates) => candidates,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(provider = %self.provider.name(), title = %title, error = %e, "Unusable search response");
                Vec::new()
            }
        };

        let resolution = pick_best(title, year, kind, &candidates, self.threshold);
        self.record(title, year, kind, &resolution);
        Ok(resolution)
    }

    /// Resolve an item, trying its foreign identifiers before a title search
    pub async fn resolve_item(&self, item: &Item) -> Result<Resolution, ProviderError> {
        let foreign = item
            .external_refs()
            .filter(|r| r.source != IdSource::Tmdb && r.is_well_formed());

        for reference in foreign {
            match self.provider.find_by_external(&reference, item.kind).await {
                Ok(Some(candidate)) if candidate.kind == item.kind => {
                    self.tries.fetch_add(1, Ordering::Relaxed);
                    let resolution = Resolution::Match(ScoredCandidate {
                        candidate,
                        breakdown: ScoreBreakdown {
                            total: 1.0,
                            ..Default::default()
                        },
                        exact_year: false,
                    });
                    debug!(item = %item.id, reference = %reference, "Resolved through external id");
                    self.record(&item.title, item.year, item.kind, &resolution);
                    return Ok(resolution);
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    debug!(reference = %reference, error = %e, "External id lookup unusable");
                }
            }
        }

        self.resolve(&normalize(&item.title), item.year, item.kind)
            .await
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            tries: self.tries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.tries.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
    }

    fn record(&self, title: &str, year: Option<i32>, kind: ItemKind, resolution: &Resolution) {
        let title = clean_bidi(title);
        let year = year.map_or_else(|| "-".to_string(), |y| y.to_string());
        match resolution {
            Resolution::Match(best) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                info!(
                    %kind,
                    title = %title,
                    id = %best.candidate.external,
                    score = best.score(),
                    "Provider match"
                );
                self.sinks.record(
                    Sink::ProviderHits,
                    format!(
                        "HIT | type={} | title={} | id={} | score={:.2} | year={}",
                        kind,
                        title,
                        best.candidate.external,
                        best.score(),
                        year
                    ),
                );
            }
            Resolution::NoMatch { best_score } => {
                info!(%kind, title = %title, best_score = ?best_score, "No provider match");
                self.sinks.record(
                    Sink::ProviderHits,
                    format!("MISS | type={} | title={} | year={}", kind, title, year),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ExternalRef;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn candidate(
        id: i64,
        title: &str,
        year: Option<i32>,
        relevance: f64,
        order: usize,
    ) -> ResolutionCandidate {
        ResolutionCandidate {
            external: ExternalRef::tmdb(id),
            title: title.to_string(),
            year,
            kind: ItemKind::Movie,
            relevance,
            popularity: None,
            order,
        }
    }

    #[test]
    fn test_exact_year_beats_higher_relevance() {
        let candidates = vec![
            candidate(1, "Inception", Some(2010), 0.9, 0),
            candidate(2, "Inception", Some(2011), 0.95, 1),
        ];

        let resolution = pick_best(
            "inception",
            Some(2010),
            ItemKind::Movie,
            &candidates,
            DEFAULT_ACCEPTANCE_THRESHOLD,
        );
        assert_matches!(resolution, Resolution::Match(best) => {
            assert_eq!(best.candidate.external, ExternalRef::tmdb(1));
            assert!(best.exact_year);
        });
    }

    #[test]
    fn test_disqualifications() {
        let mut show = candidate(3, "Inception", Some(2010), 1.0, 0);
        show.kind = ItemKind::Show;
        assert!(score_candidate("inception", Some(2010), ItemKind::Movie, &show, 1.0).is_none());

        let far = candidate(4, "Inception", Some(2014), 1.0, 0);
        assert!(score_candidate("inception", Some(2010), ItemKind::Movie, &far, 1.0).is_none());

        let other = candidate(5, "Interstellar", Some(2010), 1.0, 0);
        assert!(score_candidate("inception", Some(2010), ItemKind::Movie, &other, 1.0).is_none());
    }

    #[test]
    fn test_unknown_year_can_still_match() {
        let candidates = vec![candidate(6, "Inception", None, 1.0, 0)];
        let resolution = pick_best(
            "inception",
            Some(2010),
            ItemKind::Movie,
            &candidates,
            DEFAULT_ACCEPTANCE_THRESHOLD,
        );
        // 0.60 title + 0.10 relevance
        assert_matches!(resolution, Resolution::Match(best) => {
            assert!((best.score() - 0.70).abs() < 1e-9);
        });
    }

    #[test]
    fn test_threshold_must_be_exceeded() {
        let candidates = vec![candidate(7, "Inception", None, 0.0, 0)];
        let resolution = pick_best("inception", None, ItemKind::Movie, &candidates, 0.60);
        assert_eq!(
            resolution,
            Resolution::NoMatch {
                best_score: Some(0.60)
            }
        );

        assert_eq!(
            pick_best("inception", None, ItemKind::Movie, &[], 0.55),
            Resolution::NoMatch { best_score: None }
        );
    }

    #[test]
    fn test_ties_prefer_popularity_then_order() {
        let mut a = candidate(8, "Heat", Some(1995), 1.0, 1);
        let mut b = candidate(9, "Heat", Some(1995), 1.0, 0);
        a.popularity = Some(50.0);
        b.popularity = Some(10.0);

        let resolution = pick_best("heat", Some(1995), ItemKind::Movie, &[a.clone(), b.clone()], 0.55);
        assert_matches!(resolution, Resolution::Match(best) => {
            assert_eq!(best.candidate.external, ExternalRef::tmdb(8));
        });

        a.popularity = None;
        b.popularity = None;
        let resolution = pick_best("heat", Some(1995), ItemKind::Movie, &[a, b], 0.55);
        assert_matches!(resolution, Resolution::Match(best) => {
            assert_eq!(best.candidate.external, ExternalRef::tmdb(9));
        });
    }

    #[test]
    fn test_stats_hit_rate() {
        assert_eq!(ResolverStats::default().hit_rate(), None);
        let stats = ResolverStats { tries: 4, hits: 1 };
        assert_eq!(stats.hit_rate(), Some(0.25));
    }
}
