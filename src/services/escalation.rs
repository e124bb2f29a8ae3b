//! Failure escalation
//!
//! Pure decision logic for one item: whether it may be attempted now, and what its state
//! record becomes after an attempt. Nothing here does I/O; the reconciler applies the
//! resulting [`StateChange`] through the item state repository.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Persisted status of an item record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Healthy,
    Failing,
    Dead,
    Recovered,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Healthy => "healthy",
            ItemStatus::Failing => "failing",
            ItemStatus::Dead => "dead",
            ItemStatus::Recovered => "recovered",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(ItemStatus::Healthy),
            "failing" => Ok(ItemStatus::Failing),
            "dead" => Ok(ItemStatus::Dead),
            "recovered" => Ok(ItemStatus::Recovered),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a repair attempt counted as a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The server refused the refresh request
    MetadataRejected,
    /// Refresh went through but fields are still missing
    RefreshIncomplete,
    RefreshTimeout,
    /// The provider had no acceptable candidate
    NoMatch,
    /// The server refused or dropped the injected identifier
    IdentifierRejected,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::MetadataRejected => "metadata_rejected",
            FailureCategory::RefreshIncomplete => "refresh_incomplete",
            FailureCategory::RefreshTimeout => "refresh_timeout",
            FailureCategory::NoMatch => "no_match",
            FailureCategory::IdentifierRejected => "identifier_rejected",
        }
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata_rejected" => Ok(FailureCategory::MetadataRejected),
            "refresh_incomplete" => Ok(FailureCategory::RefreshIncomplete),
            "refresh_timeout" => Ok(FailureCategory::RefreshTimeout),
            "no_match" => Ok(FailureCategory::NoMatch),
            "identifier_rejected" => Ok(FailureCategory::IdentifierRejected),
            other => Err(format!("unknown failure category: {other}")),
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one repair attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ContentFailure(FailureCategory),
    /// The provider could not be reached; says nothing about the item
    Transient,
}

/// Escalation state of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Healthy,
    Failing { failures: u32 },
    Dead { failures: u32 },
    Recovered,
}

impl Escalation {
    /// Transition on an attempt outcome
    pub fn on_outcome(self, outcome: Outcome, dead_threshold: u32) -> Escalation {
        match outcome {
            Outcome::Transient => self,
            Outcome::Success => match self {
                Escalation::Failing { .. } | Escalation::Dead { .. } => Escalation::Recovered,
                Escalation::Healthy | Escalation::Recovered => Escalation::Healthy,
            },
            Outcome::ContentFailure(_) => {
                let failures = self.failures() + 1;
                if failures >= dead_threshold {
                    Escalation::Dead { failures }
                } else {
                    Escalation::Failing { failures }
                }
            }
        }
    }

    pub fn failures(&self) -> u32 {
        match self {
            Escalation::Failing { failures } | Escalation::Dead { failures } => *failures,
            Escalation::Healthy | Escalation::Recovered => 0,
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            Escalation::Healthy => ItemStatus::Healthy,
            Escalation::Failing { .. } => ItemStatus::Failing,
            Escalation::Dead { .. } => ItemStatus::Dead,
            Escalation::Recovered => ItemStatus::Recovered,
        }
    }
}

/// Cooldown durations indexed by `failure_count - 1`, clamped to the last tier
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownTiers(Vec<TimeDelta>);

impl CooldownTiers {
    /// Tiers must be non-empty, non-negative and non-decreasing
    pub fn new(tiers: Vec<TimeDelta>) -> Result<Self, String> {
        if tiers.is_empty() {
            return Err("at least one cooldown tier is required".to_string());
        }
        if tiers.iter().any(|t| *t < TimeDelta::zero()) {
            return Err("cooldown tiers must not be negative".to_string());
        }
        if tiers.windows(2).any(|w| w[1] < w[0]) {
            return Err("cooldown tiers must be non-decreasing".to_string());
        }
        Ok(Self(tiers))
    }

    pub fn from_days(days: &[i64]) -> Result<Self, String> {
        let tiers = days
            .iter()
            .map(|d| TimeDelta::try_days(*d).ok_or_else(|| format!("{d} days is out of range")))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(tiers)
    }

    pub fn for_failures(&self, failures: u32) -> TimeDelta {
        let index = (failures.max(1) as usize - 1).min(self.0.len() - 1);
        self.0[index]
    }

    pub fn tiers(&self) -> &[TimeDelta] {
        &self.0
    }
}

impl Default for CooldownTiers {
    fn default() -> Self {
        Self(vec![
            TimeDelta::days(1),
            TimeDelta::days(7),
            TimeDelta::days(14),
            TimeDelta::days(30),
        ])
    }
}

/// Persisted record of an item that has failed at least once
#[derive(Debug, Clone, PartialEq)]
pub struct ItemState {
    pub item_id: String,
    pub library_id: String,
    pub status: ItemStatus,
    pub failure_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<FailureCategory>,
    pub last_checked_at: DateTime<Utc>,
    /// Upstream last-modified timestamp at the last attempt
    pub item_updated_at: Option<DateTime<Utc>>,
    pub first_failed_at: DateTime<Utc>,
}

impl ItemState {
    pub fn escalation(&self) -> Escalation {
        match self.status {
            ItemStatus::Healthy => Escalation::Healthy,
            ItemStatus::Recovered => Escalation::Recovered,
            ItemStatus::Failing => Escalation::Failing {
                failures: self.failure_count,
            },
            ItemStatus::Dead => Escalation::Dead {
                failures: self.failure_count,
            },
        }
    }
}

/// Whether an item may be attempted now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Attempt,
    /// Dead, but the item changed upstream since it was archived
    Revive,
    CoolingDown { until: DateTime<Utc> },
    Dead,
}

impl Eligibility {
    pub fn may_attempt(&self) -> bool {
        matches!(self, Eligibility::Attempt | Eligibility::Revive)
    }
}

/// Eligibility of an item given its record and current upstream timestamp
pub fn eligibility(
    state: Option<&ItemState>,
    item_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Eligibility {
    let Some(state) = state else {
        return Eligibility::Attempt;
    };

    if state.status == ItemStatus::Dead {
        let changed = item_updated_at.is_some() && item_updated_at != state.item_updated_at;
        return if changed {
            Eligibility::Revive
        } else {
            Eligibility::Dead
        };
    }

    match state.next_retry_at {
        Some(until) if now < until => Eligibility::CoolingDown { until },
        _ => Eligibility::Attempt,
    }
}

/// Item identity needed to build a record
#[derive(Debug, Clone)]
pub struct AttemptContext<'a> {
    pub item_id: &'a str,
    pub library_id: &'a str,
    pub item_updated_at: Option<DateTime<Utc>>,
}

/// Persistence effect of an attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Unchanged,
    /// Write to the active table (and drop any archived copy)
    Upsert(ItemState),
    /// Move to the archive table
    Archive(ItemState),
    /// Forget the item entirely
    Remove(String),
}

/// Observable effect of an attempt, used for logging and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    Healthy,
    Recovered,
    Failed {
        failures: u32,
        retry_at: DateTime<Utc>,
    },
    Died {
        failures: u32,
    },
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub change: StateChange,
    pub event: TransitionEvent,
}

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub tiers: CooldownTiers,
    pub dead_threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            tiers: CooldownTiers::default(),
            dead_threshold: 5,
        }
    }
}

impl EscalationPolicy {
    /// Work out the record change for an attempt outcome
    pub fn apply(
        &self,
        previous: Option<&ItemState>,
        ctx: &AttemptContext<'_>,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Transition {
        let current = previous
            .map(ItemState::escalation)
            .unwrap_or(Escalation::Healthy);
        let next = current.on_outcome(outcome, self.dead_threshold);

        match outcome {
            Outcome::Transient => Transition {
                change: StateChange::Unchanged,
                event: TransitionEvent::Deferred,
            },
            Outcome::Success => match next {
                Escalation::Recovered => Transition {
                    change: StateChange::Upsert(ItemState {
                        item_id: ctx.item_id.to_string(),
                        library_id: ctx.library_id.to_string(),
                        status: ItemStatus::Recovered,
                        failure_count: 0,
                        next_retry_at: None,
                        last_error: None,
                        last_checked_at: now,
                        item_updated_at: ctx.item_updated_at,
                        first_failed_at: previous.map(|p| p.first_failed_at).unwrap_or(now),
                    }),
                    event: TransitionEvent::Recovered,
                },
                _ => Transition {
                    change: match previous {
                        Some(_) => StateChange::Remove(ctx.item_id.to_string()),
                        None => StateChange::Unchanged,
                    },
                    event: TransitionEvent::Healthy,
                },
            },
            Outcome::ContentFailure(category) => {
                let failures = next.failures();
                let tier_retry = now
                    .checked_add_signed(self.tiers.for_failures(failures))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                // Never move an existing retry time earlier
                let retry_at = previous
                    .and_then(|p| p.next_retry_at)
                    .map_or(tier_retry, |prev| prev.max(tier_retry));

                let state = ItemState {
                    item_id: ctx.item_id.to_string(),
                    library_id: ctx.library_id.to_string(),
                    status: next.status(),
                    failure_count: failures,
                    next_retry_at: Some(retry_at),
                    last_error: Some(category),
                    last_checked_at: now,
                    item_updated_at: ctx.item_updated_at,
                    first_failed_at: previous.map(|p| p.first_failed_at).unwrap_or(now),
                };

                if matches!(next, Escalation::Dead { .. }) {
                    Transition {
                        change: StateChange::Archive(state),
                        event: TransitionEvent::Died { failures },
                    }
                } else {
                    Transition {
                        change: StateChange::Upsert(state),
                        event: TransitionEvent::Failed { failures, retry_at },
                    }
                }
            }
        }
    }
}
