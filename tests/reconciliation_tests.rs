//! Per-item reconciliation against the state store

mod common;

use assert_matches::assert_matches;
use chrono::{DateTime, TimeDelta, Utc};
use pretty_assertions::assert_eq;

use common::{Harness, candidate, unmatched_item};
use refresher::db::StoredState;
use refresher::services::escalation::{FailureCategory, ItemStatus};
use refresher::services::logging::Sink;
use refresher::services::reconciler::{ItemOutcome, RepairAction, SkipReason};

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_710_000_000, 0).unwrap()
}

#[tokio::test]
async fn test_unmatched_item_escalates_to_dead() {
    let h = Harness::new().await;
    let item = unmatched_item("7", "Some Obscure Film", 1990);
    h.server.put(item.clone());

    let mut now = start();
    for attempt in 1..=4u32 {
        let outcome = h.reconciler.reconcile(&item, now).await.unwrap();
        assert_matches!(
            outcome,
            ItemOutcome::Failed { category: FailureCategory::NoMatch, failures, .. } if failures == attempt
        );
        now += TimeDelta::days(31);
    }

    let state = h.db.item_states().get("7").await.unwrap().unwrap();
    assert_matches!(state, StoredState::Active(_));
    assert_eq!(state.state().failure_count, 4);
    assert_eq!(state.state().status, ItemStatus::Failing);

    let outcome = h.reconciler.reconcile(&item, now).await.unwrap();
    assert_eq!(
        outcome,
        ItemOutcome::Died {
            category: FailureCategory::NoMatch,
            failures: 5
        }
    );

    let state = h.db.item_states().get("7").await.unwrap().unwrap();
    assert_matches!(state, StoredState::Archived(_));
    assert_eq!(state.state().status, ItemStatus::Dead);

    // Left alone from now on
    let later = now + TimeDelta::days(365);
    assert_eq!(
        h.reconciler.reconcile(&item, later).await.unwrap(),
        ItemOutcome::Skipped(SkipReason::Dead)
    );

    h.sinks.flush();
    assert_eq!(h.writer.lines(Sink::Failed).len(), 4);
    let dead = h.writer.lines(Sink::Dead);
    assert_eq!(dead.len(), 1);
    assert!(dead[0].contains("id=7"));
    assert!(dead[0].contains("reason=no_match"));
}

#[tokio::test]
async fn test_cooldown_follows_tiers() {
    let h = Harness::new().await;
    let item = unmatched_item("8", "Nothing Like It", 2001);
    h.server.put(item.clone());

    let now = start();
    let outcome = h.reconciler.reconcile(&item, now).await.unwrap();
    assert_matches!(outcome, ItemOutcome::Failed { retry_at, .. } if retry_at == now + TimeDelta::days(1));

    // Still cooling down an hour later
    let soon = now + TimeDelta::hours(1);
    assert_matches!(
        h.reconciler.reconcile(&item, soon).await.unwrap(),
        ItemOutcome::Skipped(SkipReason::CoolingDown { .. })
    );

    let next = now + TimeDelta::days(2);
    let outcome = h.reconciler.reconcile(&item, next).await.unwrap();
    assert_matches!(
        outcome,
        ItemOutcome::Failed { failures: 2, retry_at, .. } if retry_at == next + TimeDelta::days(7)
    );

    let state = h.db.item_states().get("8").await.unwrap().unwrap().into_state();
    assert_eq!(state.next_retry_at, Some(next + TimeDelta::days(7)));
    assert_eq!(state.first_failed_at, now);
}

#[tokio::test]
async fn test_failing_item_recovers_then_is_forgotten() {
    let h = Harness::new().await;
    let item = unmatched_item("9", "Inception", 2010);
    h.server.put(item.clone());
    h.server.make_fixable("9");

    let now = start();
    assert_matches!(
        h.reconciler.reconcile(&item, now).await.unwrap(),
        ItemOutcome::Failed { .. }
    );

    // The provider learns about the film
    h.provider.answer("inception", vec![candidate(27205, "Inception", 2010, 0)]);
    let later = now + TimeDelta::days(2);
    let outcome = h.reconciler.reconcile(&item, later).await.unwrap();
    assert_matches!(outcome, ItemOutcome::Recovered(RepairAction::Injected(ref r)) if r.id == "27205");

    let state = h.db.item_states().get("9").await.unwrap().unwrap();
    assert_matches!(state, StoredState::Active(_));
    assert_eq!(state.state().status, ItemStatus::Recovered);
    assert_eq!(state.state().failure_count, 0);
    assert_eq!(state.state().next_retry_at, None);
    assert!(h.server.item("9").guids.contains(&"tmdb://27205".to_string()));

    // Healthy on the next look, and the record goes away
    let repaired = h.server.item("9");
    assert_eq!(
        h.reconciler
            .reconcile(&repaired, later + TimeDelta::days(1))
            .await
            .unwrap(),
        ItemOutcome::Healthy(RepairAction::None)
    );
    assert_eq!(h.db.item_states().get("9").await.unwrap(), None);

    h.sinks.flush();
    assert_eq!(h.writer.lines(Sink::Recovered).len(), 1);
    assert!(h.writer.lines(Sink::ProviderHits).iter().any(|l| l.contains("HIT")));
}

#[tokio::test]
async fn test_transient_provider_error_records_nothing() {
    let h = Harness::new().await;
    let item = unmatched_item("10", "Heat", 1995);
    h.server.put(item.clone());
    h.provider
        .unavailable
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let now = start();
    assert_eq!(
        h.reconciler.reconcile(&item, now).await.unwrap(),
        ItemOutcome::Deferred
    );
    assert_eq!(h.db.item_states().get("10").await.unwrap(), None);

    // An existing record keeps its count and retry time
    h.provider
        .unavailable
        .store(false, std::sync::atomic::Ordering::SeqCst);
    h.reconciler.reconcile(&item, now).await.unwrap();
    let before = h.db.item_states().get("10").await.unwrap().unwrap().into_state();

    h.provider
        .unavailable
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let after_cooldown = now + TimeDelta::days(3);
    assert_eq!(
        h.reconciler.reconcile(&item, after_cooldown).await.unwrap(),
        ItemOutcome::Deferred
    );
    let after = h.db.item_states().get("10").await.unwrap().unwrap().into_state();
    assert_eq!(after.failure_count, before.failure_count);
    assert_eq!(after.next_retry_at, before.next_retry_at);
}

#[tokio::test]
async fn test_refresh_fills_missing_fields() {
    let h = Harness::new().await;
    let mut item = unmatched_item("11", "Alien", 1979);
    item.guids = vec!["tmdb://348".to_string()];
    h.server.put(item.clone());

    // Refresh does not help yet
    let now = start();
    assert_matches!(
        h.reconciler.reconcile(&item, now).await.unwrap(),
        ItemOutcome::Failed {
            category: FailureCategory::RefreshIncomplete,
            ..
        }
    );

    h.server.make_fixable("11");
    assert_eq!(
        h.reconciler
            .reconcile(&item, now + TimeDelta::days(2))
            .await
            .unwrap(),
        ItemOutcome::Recovered(RepairAction::Refreshed)
    );
    assert_eq!(h.provider.searches.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_imdb_only_item_is_translated_to_tmdb() {
    let h = Harness::new().await;
    let mut item = unmatched_item("14", "Inception", 2010);
    item.guids = vec!["imdb://tt1375666".to_string()];
    h.server.put(item.clone());
    h.server.make_fixable("14");
    h.provider
        .translate("imdb://tt1375666", candidate(27205, "Inception", 2010, 0));

    let outcome = h.reconciler.reconcile(&item, start()).await.unwrap();
    assert_matches!(outcome, ItemOutcome::Healthy(RepairAction::Injected(ref r)) if r.id == "27205");

    assert_eq!(h.provider.external_lookups.load(std::sync::atomic::Ordering::SeqCst), 1);
    // Translated without a title search
    assert_eq!(h.provider.searches.load(std::sync::atomic::Ordering::SeqCst), 0);
    let injected = h.server.injected.lock().clone();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].1.id, "27205");
    assert!(h.server.item("14").guids.contains(&"tmdb://27205".to_string()));
}

#[tokio::test]
async fn test_dead_item_revived_by_upstream_change() {
    let h = Harness::new().await;
    let mut item = unmatched_item("12", "The Thing", 1982);
    h.server.put(item.clone());

    let mut now = start();
    for _ in 0..5 {
        h.reconciler.reconcile(&item, now).await.unwrap();
        now += TimeDelta::days(31);
    }
    assert_eq!(h.db.item_states().count_dead().await.unwrap(), 1);

    // Someone fixes the match in Plex; the item's timestamp moves
    item.updated_at = item.updated_at.map(|t| t + TimeDelta::hours(1));
    item.guids = vec!["tmdb://1091".to_string()];
    h.server.put(item.clone());
    h.server.make_fixable("12");

    assert_eq!(
        h.reconciler.reconcile(&item, now).await.unwrap(),
        ItemOutcome::Recovered(RepairAction::Refreshed)
    );
    let state = h.db.item_states().get("12").await.unwrap().unwrap();
    assert_matches!(state, StoredState::Active(_));
    assert_eq!(h.db.item_states().count_dead().await.unwrap(), 0);
}

#[tokio::test]
async fn test_manual_reset() {
    let h = Harness::new().await;
    let item = unmatched_item("13", "Nope", 2022);
    h.server.put(item.clone());
    h.reconciler.reconcile(&item, start()).await.unwrap();

    assert!(h.db.item_states().reset("13").await.unwrap());
    assert!(!h.db.item_states().reset("13").await.unwrap());
    assert_eq!(h.db.item_states().get("13").await.unwrap(), None);
}
