//! Chunked library scanner
//!
//! Walks a library's item references in fixed-size windows. Each window is classified
//! against the state store and the scan ledger, the items worth examining are fetched
//! (never more than one window of payloads at a time) and reconciled one by one. The
//! cursor only moves past a window once it has been fully processed, so a scan
//! interrupted by the server going away resumes at the same window.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info};

use super::escalation::{Eligibility, ItemStatus, eligibility};
use super::reconciler::{ItemOutcome, Reconciler, RepairAction, SkipReason};
use crate::db::{LedgerEntry, StoredState};
use crate::error::ScanError;
use crate::media::{ItemRef, Library};

/// Run-wide budget of examined items, shared by every library
#[derive(Debug)]
pub struct ItemQuota {
    limit: usize,
    used: AtomicUsize,
}

impl ItemQuota {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Take up to `wanted` items from the quota, returning how many were granted
    pub fn reserve(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                granted = wanted.min(self.limit.saturating_sub(used));
                Some(used + granted)
            });
        granted
    }

    /// Give back items that were reserved but not examined
    pub fn release(&self, count: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(count))
            });
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.limit
    }
}

/// Why an item in a window is worth examining, in order of precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Has a failure record whose cooldown is over, a recovered record awaiting its
    /// confirming check, or a dead record revived by an upstream change
    RetryDue,
    /// Never examined before
    New,
    /// Changed upstream since it was last examined
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Selected(Priority),
    CoolingDown,
    Dead,
    Unchanged,
}

/// Decide whether an item reference needs examining
pub fn classify(
    item: &ItemRef,
    stored: Option<&StoredState>,
    ledger: Option<&LedgerEntry>,
    lookback: TimeDelta,
    now: DateTime<Utc>,
) -> Classification {
    if let Some(stored) = stored {
        let state = stored.state();
        match eligibility(Some(state), item.updated_at, now) {
            Eligibility::Dead => return Classification::Dead,
            Eligibility::CoolingDown { .. } => return Classification::CoolingDown,
            Eligibility::Revive => return Classification::Selected(Priority::RetryDue),
            // A recovered record is confirmed (and dropped) by one more clean check
            Eligibility::Attempt
                if matches!(state.status, ItemStatus::Failing | ItemStatus::Recovered) =>
            {
                return Classification::Selected(Priority::RetryDue);
            }
            Eligibility::Attempt => {}
        }
    }

    let Some(entry) = ledger else {
        return Classification::Selected(Priority::New);
    };

    let changed_recently = match item.updated_at {
        Some(updated) => entry.item_updated_at != Some(updated) && now - updated <= lookback,
        None => false,
    };
    if changed_recently {
        Classification::Selected(Priority::Changed)
    } else {
        Classification::Unchanged
    }
}

/// Window `[cursor, cursor + chunk_size)` clipped to `len`, `None` once past the end
pub fn window_at(cursor: usize, len: usize, chunk_size: usize) -> Option<Range<usize>> {
    (cursor < len).then(|| cursor..(cursor + chunk_size.max(1)).min(len))
}

/// What happened in one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkReport {
    pub window: Range<usize>,
    /// Items selected for examination after the quota was applied
    pub selected: usize,
    /// Payloads fetched from the server
    pub fetched: usize,
    pub checked: usize,
    pub healthy: usize,
    pub fixed: usize,
    pub failed: usize,
    pub recovered: usize,
    pub transient: usize,
    pub cooling: usize,
    pub dead_skipped: usize,
    pub unchanged: usize,
    /// Display titles of items that became dead in this window
    pub new_dead: Vec<String>,
    /// Selection was cut short by the run quota
    pub quota_limited: bool,
}

impl ChunkReport {
    fn count(&mut self, outcome: &ItemOutcome) {
        if outcome.was_checked() {
            self.checked += 1;
        }
        match outcome {
            ItemOutcome::Healthy(RepairAction::None) => self.healthy += 1,
            ItemOutcome::Healthy(_) => self.fixed += 1,
            ItemOutcome::Recovered(_) => self.recovered += 1,
            ItemOutcome::Failed { .. } | ItemOutcome::Died { .. } => self.failed += 1,
            ItemOutcome::Deferred => self.transient += 1,
            ItemOutcome::Skipped(SkipReason::CoolingDown { .. }) => self.cooling += 1,
            ItemOutcome::Skipped(SkipReason::Dead) => self.dead_skipped += 1,
        }
    }
}

/// Everything a window needs from the run
pub struct ScanContext<'a> {
    pub reconciler: &'a Reconciler,
    pub quota: &'a ItemQuota,
    pub lookback: TimeDelta,
}

pub struct ChunkedScanner {
    library: Library,
    refs: Vec<ItemRef>,
    chunk_size: usize,
    cursor: usize,
}

impl ChunkedScanner {
    pub fn new(library: Library, refs: Vec<ItemRef>, chunk_size: usize) -> Self {
        Self {
            library,
            refs,
            chunk_size: chunk_size.max(1),
            cursor: 0,
        }
    }

    /// Continue an earlier scan from `cursor`
    pub fn resume_at(mut self, cursor: usize) -> Self {
        self.cursor = cursor.min(self.refs.len());
        self
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.refs.len()
    }

    pub fn remaining(&self) -> usize {
        self.refs.len() - self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.refs.len()
    }

    /// The window the next call to [`next_chunk`](Self::next_chunk) will process
    pub fn next_window(&self) -> Option<Range<usize>> {
        window_at(self.cursor, self.refs.len(), self.chunk_size)
    }

    /// Process the next window. `Ok(None)` once the library is exhausted.
    pub async fn next_chunk(
        &mut self,
        ctx: &ScanContext<'_>,
    ) -> Result<Option<ChunkReport>, ScanError> {
        let Some(window) = self.next_window() else {
            return Ok(None);
        };
        let now = Utc::now();
        let refs = &self.refs[window.clone()];
        let ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();

        let reconciler = ctx.reconciler;
        let states = reconciler.db().item_states().get_many(&ids).await?;
        let ledger = reconciler.db().scan_ledger().get_many(&ids).await?;

        let mut report = ChunkReport {
            window: window.clone(),
            ..Default::default()
        };

        let mut selected: Vec<(Priority, &ItemRef)> = Vec::new();
        for item in refs {
            match classify(
                item,
                states.get(&item.id),
                ledger.get(&item.id),
                ctx.lookback,
                now,
            ) {
                Classification::Selected(priority) => selected.push((priority, item)),
                Classification::CoolingDown => report.cooling += 1,
                Classification::Dead => report.dead_skipped += 1,
                Classification::Unchanged => report.unchanged += 1,
            }
        }
        // Stable, so server order (most recently modified first) holds within a class
        selected.sort_by_key(|(priority, _)| *priority);

        let granted = ctx.quota.reserve(selected.len());
        if granted < selected.len() {
            report.quota_limited = true;
            selected.truncate(granted);
        }
        report.selected = selected.len();

        if selected.is_empty() {
            self.finish_window(reconciler, &window, &report);
            return Ok(Some(report));
        }

        let selected_ids: Vec<String> = selected.iter().map(|(_, r)| r.id.clone()).collect();
        let payloads = match reconciler.server().fetch_items(&selected_ids).await {
            Ok(items) => items,
            Err(e) => {
                ctx.quota.release(selected_ids.len());
                return Err(e.into());
            }
        };
        report.fetched = payloads.len();
        let mut payloads: HashMap<String, _> =
            payloads.into_iter().map(|i| (i.id.clone(), i)).collect();

        let ledger_repo = reconciler.db().scan_ledger();
        for (done, id) in selected_ids.iter().enumerate() {
            // Gone from the server since the library was listed
            let Some(item) = payloads.remove(id) else {
                ctx.quota.release(1);
                continue;
            };

            let result = reconciler.reconcile(&item, Utc::now()).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    ctx.quota.release(selected_ids.len() - done);
                    return Err(e);
                }
            };

            if outcome.is_settled() {
                ledger_repo
                    .touch(&item.id, &item.library_id, item.updated_at, Utc::now())
                    .await?;
            }
            if let ItemOutcome::Died { .. } = outcome {
                report.new_dead.push(item.display_title());
            }
            report.count(&outcome);
        }

        self.finish_window(reconciler, &window, &report);
        Ok(Some(report))
    }

    fn finish_window(&mut self, reconciler: &Reconciler, window: &Range<usize>, report: &ChunkReport) {
        self.cursor = window.end;
        reconciler.sinks().flush();
        debug!(
            library = %self.library.title,
            window = ?window,
            selected = report.selected,
            checked = report.checked,
            failed = report.failed,
            "Window done"
        );
        if self.is_finished() {
            info!(library = %self.library.title, items = self.refs.len(), "Library scan complete");
        }
    }
}
