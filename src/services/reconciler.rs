//! Per-item reconciliation
//!
//! Checks one item's metadata, repairs it through the media server when needed and
//! records the outcome through the escalation policy. The read of the item's record and
//! the write of its new one happen under the item's lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::escalation::{
    AttemptContext, Eligibility, EscalationPolicy, FailureCategory, Outcome, TransitionEvent,
    eligibility,
};
use super::item_locks::ItemLocks;
use super::logging::{LogSinks, Sink};
use super::resolver::{Resolution, Resolver};
use crate::db::{Database, StoredState};
use crate::error::ScanError;
use crate::media::{ExternalRef, Item, MediaServer, MediaServerError, MetadataCheck};

/// What was done to an item that ended up healthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// Metadata was already complete
    None,
    /// A server refresh filled in missing fields
    Refreshed,
    /// A provider identifier was attached before refreshing
    Injected(ExternalRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CoolingDown { until: DateTime<Utc> },
    Dead,
}

/// Result of reconciling one item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Healthy(RepairAction),
    Recovered(RepairAction),
    Failed {
        category: FailureCategory,
        failures: u32,
        retry_at: DateTime<Utc>,
    },
    Died {
        category: FailureCategory,
        failures: u32,
    },
    /// Provider trouble; nothing recorded, the item is retried on a later run
    Deferred,
    Skipped(SkipReason),
}

impl ItemOutcome {
    /// Whether a repair was actually attempted
    pub fn was_checked(&self) -> bool {
        !matches!(self, ItemOutcome::Skipped(_))
    }

    /// Whether the outcome is final for this run and the item can be marked as seen
    pub fn is_settled(&self) -> bool {
        !matches!(self, ItemOutcome::Deferred | ItemOutcome::Skipped(_))
    }
}

/// Repair verdict before the policy is applied
#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    outcome: Outcome,
    action: RepairAction,
}

impl Attempt {
    fn success(action: RepairAction) -> Self {
        Self {
            outcome: Outcome::Success,
            action,
        }
    }

    fn failure(category: FailureCategory) -> Self {
        Self {
            outcome: Outcome::ContentFailure(category),
            action: RepairAction::None,
        }
    }

    fn transient() -> Self {
        Self {
            outcome: Outcome::Transient,
            action: RepairAction::None,
        }
    }
}

/// Map a server error during repair to a content failure. Unavailability is not the
/// item's fault and stops the scan instead.
fn content_failure(
    err: MediaServerError,
    otherwise: FailureCategory,
) -> Result<FailureCategory, ScanError> {
    match err {
        MediaServerError::Unavailable(_) => Err(err.into()),
        MediaServerError::Timeout(_) => Ok(FailureCategory::RefreshTimeout),
        MediaServerError::Rejected(_) | MediaServerError::Malformed(_) => Ok(otherwise),
    }
}

pub struct Reconciler {
    server: Arc<dyn MediaServer>,
    resolver: Arc<Resolver>,
    db: Database,
    locks: ItemLocks,
    policy: EscalationPolicy,
    sinks: Arc<LogSinks>,
    refresh_settle: Duration,
}

impl Reconciler {
    pub fn new(
        server: Arc<dyn MediaServer>,
        resolver: Arc<Resolver>,
        db: Database,
        policy: EscalationPolicy,
        sinks: Arc<LogSinks>,
    ) -> Self {
        Self {
            server,
            resolver,
            db,
            locks: ItemLocks::new(),
            policy,
            sinks,
            refresh_settle: Duration::from_secs(1),
        }
    }

    /// Pause between asking for a refresh and reading the item back
    pub fn with_refresh_settle(mut self, settle: Duration) -> Self {
        self.refresh_settle = settle;
        self
    }

    pub fn server(&self) -> &Arc<dyn MediaServer> {
        &self.server
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn sinks(&self) -> &Arc<LogSinks> {
        &self.sinks
    }

    /// Examine and, if needed, repair one item
    pub async fn reconcile(&self, item: &Item, now: DateTime<Utc>) -> Result<ItemOutcome, ScanError> {
        let _guard = self.locks.acquire(&item.id).await;
        let repo = self.db.item_states();

        let stored = repo.get(&item.id).await?;
        let previous = stored.as_ref().map(StoredState::state);

        match eligibility(previous, item.updated_at, now) {
            Eligibility::Dead => return Ok(ItemOutcome::Skipped(SkipReason::Dead)),
            Eligibility::CoolingDown { until } => {
                return Ok(ItemOutcome::Skipped(SkipReason::CoolingDown { until }));
            }
            Eligibility::Revive => {
                info!(item = %item.id, title = %item.display_title(), "Dead item changed upstream, retrying");
            }
            Eligibility::Attempt => {}
        }

        let attempt = self.repair(item).await?;

        let ctx = AttemptContext {
            item_id: &item.id,
            library_id: &item.library_id,
            item_updated_at: item.updated_at,
        };
        let transition = self.policy.apply(previous, &ctx, attempt.outcome, now);
        repo.apply(&transition.change, now).await?;

        let outcome = match (transition.event, attempt.outcome) {
            (TransitionEvent::Healthy, _) => ItemOutcome::Healthy(attempt.action),
            (TransitionEvent::Recovered, _) => ItemOutcome::Recovered(attempt.action),
            (TransitionEvent::Failed { failures, retry_at }, Outcome::ContentFailure(category)) => {
                ItemOutcome::Failed {
                    category,
                    failures,
                    retry_at,
                }
            }
            (TransitionEvent::Died { failures }, Outcome::ContentFailure(category)) => {
                ItemOutcome::Died { category, failures }
            }
            _ => ItemOutcome::Deferred,
        };

        self.log_outcome(item, &outcome);
        Ok(outcome)
    }

    async fn repair(&self, item: &Item) -> Result<Attempt, ScanError> {
        let check = MetadataCheck::of(item);
        if check.is_healthy() {
            return Ok(Attempt::success(RepairAction::None));
        }
        debug!(item = %item.id, missing = %check.describe(), "Metadata incomplete");

        if !check.missing_identifier {
            return self.refresh_and_verify(item, None).await;
        }

        let candidate = match self.resolver.resolve_item(item).await {
            Ok(Resolution::Match(best)) => best.candidate,
            Ok(Resolution::NoMatch { .. }) => return Ok(Attempt::failure(FailureCategory::NoMatch)),
            Err(e) => {
                warn!(item = %item.id, error = %e, "Provider unavailable, deferring item");
                return Ok(Attempt::transient());
            }
        };

        if let Err(e) = self
            .server
            .inject_identifier(&item.id, &candidate.external)
            .await
        {
            warn!(item = %item.id, reference = %candidate.external, error = %e, "Identifier injection failed");
            return Ok(Attempt::failure(content_failure(
                e,
                FailureCategory::IdentifierRejected,
            )?));
        }

        self.refresh_and_verify(item, Some(candidate.external)).await
    }

    /// Ask the server to refresh the item and check the result. With `expected` set, the
    /// refreshed item must also carry that identifier.
    async fn refresh_and_verify(
        &self,
        item: &Item,
        expected: Option<ExternalRef>,
    ) -> Result<Attempt, ScanError> {
        if let Err(e) = self.server.request_refresh(&item.id).await {
            return Ok(Attempt::failure(content_failure(
                e,
                FailureCategory::MetadataRejected,
            )?));
        }

        if !self.refresh_settle.is_zero() {
            tokio::time::sleep(self.refresh_settle).await;
        }

        let refreshed = match self.server.fetch_items(std::slice::from_ref(&item.id)).await {
            Ok(mut items) if !items.is_empty() => items.swap_remove(0),
            Ok(_) => return Ok(Attempt::failure(FailureCategory::MetadataRejected)),
            Err(e) => {
                return Ok(Attempt::failure(content_failure(
                    e,
                    FailureCategory::MetadataRejected,
                )?));
            }
        };

        let check = MetadataCheck::of(&refreshed);
        if let Some(expected) = &expected {
            if !refreshed.external_refs().any(|r| &r == expected) {
                return Ok(Attempt::failure(FailureCategory::IdentifierRejected));
            }
        }
        if check.missing_identifier {
            return Ok(Attempt::failure(FailureCategory::IdentifierRejected));
        }
        if !check.fields_ok() {
            debug!(item = %item.id, missing = %check.describe(), "Still incomplete after refresh");
            return Ok(Attempt::failure(FailureCategory::RefreshIncomplete));
        }

        Ok(Attempt::success(match expected {
            Some(reference) => RepairAction::Injected(reference),
            None => RepairAction::Refreshed,
        }))
    }

    fn log_outcome(&self, item: &Item, outcome: &ItemOutcome) {
        let title = item.display_title();
        match outcome {
            ItemOutcome::Healthy(RepairAction::None) => {}
            ItemOutcome::Healthy(action) => {
                info!(item = %item.id, title = %title, action = ?action, "Item repaired");
            }
            ItemOutcome::Recovered(action) => {
                info!(item = %item.id, title = %title, action = ?action, "Item recovered");
                self.sinks.record(
                    Sink::Recovered,
                    format!("RECOVERED | lib={} | id={} | title={}", item.library_id, item.id, title),
                );
            }
            ItemOutcome::Failed {
                category,
                failures,
                retry_at,
            } => {
                warn!(item = %item.id, title = %title, reason = %category, failures, "Item repair failed");
                self.sinks.record(
                    Sink::Failed,
                    format!(
                        "FAIL | lib={} | id={} | title={} | reason={} | fails={} | retry={}",
                        item.library_id,
                        item.id,
                        title,
                        category,
                        failures,
                        retry_at.format("%Y-%m-%d %H:%M")
                    ),
                );
            }
            ItemOutcome::Died { category, failures } => {
                warn!(item = %item.id, title = %title, reason = %category, failures, "Item marked dead");
                self.sinks.record(
                    Sink::Dead,
                    format!(
                        "DEAD | lib={} | id={} | title={} | reason={} | fails={}",
                        item.library_id, item.id, title, category, failures
                    ),
                );
            }
            ItemOutcome::Deferred | ItemOutcome::Skipped(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_failure_mapping() {
        assert_eq!(
            content_failure(
                MediaServerError::Timeout("refresh".into()),
                FailureCategory::MetadataRejected
            )
            .unwrap(),
            FailureCategory::RefreshTimeout
        );
        assert_eq!(
            content_failure(
                MediaServerError::Rejected("400".into()),
                FailureCategory::IdentifierRejected
            )
            .unwrap(),
            FailureCategory::IdentifierRejected
        );
        assert!(matches!(
            content_failure(
                MediaServerError::Unavailable("down".into()),
                FailureCategory::MetadataRejected
            ),
            Err(ScanError::Server(MediaServerError::Unavailable(_)))
        ));
    }

    #[test]
    fn test_outcome_flags() {
        assert!(ItemOutcome::Deferred.was_checked());
        assert!(!ItemOutcome::Deferred.is_settled());
        assert!(!ItemOutcome::Skipped(SkipReason::Dead).was_checked());
        assert!(ItemOutcome::Healthy(RepairAction::None).is_settled());
    }
}
