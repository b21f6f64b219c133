//! End-to-end claim flows over the in-memory store: resolver, engine, feed
//! and visibility together.

use std::sync::Arc;
use std::time::Duration;

use giftlist::{
    Categorizable, ClaimAction, ClaimEngine, ClaimError, Credentials, GiftlistConfig,
    IdentityProvider, IdentityResolver, ItemFeed, ItemStatus, MemoryPreferences, MemoryStore,
    Rejection, SafeErrorCategory, Uid, ViewContext, Viewer,
};
use giftlist_testing::{
    assert_claim_invariants, assert_feed_consistent, seed_list, FlakyStore,
    ScriptedIdentityProvider,
};

type Resolver = IdentityResolver<ScriptedIdentityProvider, MemoryPreferences>;

fn browser(provider: ScriptedIdentityProvider) -> (Arc<ScriptedIdentityProvider>, Resolver) {
    let provider = Arc::new(provider);
    let resolver = IdentityResolver::new(
        provider.clone(),
        Arc::new(MemoryPreferences::new()),
        ViewContext::PublicList,
        &GiftlistConfig::default(),
    );
    (provider, resolver)
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_failed_bootstrap_leaves_page_read_only() {
    let (provider, mut resolver) = browser(ScriptedIdentityProvider::failing_anonymous());

    let me = resolver.resolve().await;
    assert!(me.resolved);
    assert!(me.uid.is_none());
    resolver.set_name("Alice").unwrap();
    assert!(matches!(
        resolver.me().actor(),
        Err(ClaimError::IdentityNotReady)
    ));

    // Re-resolving on the same page does not hammer the provider.
    resolver.resolve().await;
    assert_eq!(provider.anonymous_calls(), 1);
}

#[tokio::test]
async fn test_bootstrap_runs_once_per_browser() {
    let (provider, mut resolver) = browser(ScriptedIdentityProvider::new());

    let first = resolver.resolve().await;
    let second = resolver.resolve().await;
    assert_eq!(first.uid, second.uid);
    assert_eq!(provider.anonymous_calls(), 1);
}

#[tokio::test]
async fn test_signed_in_visitor_is_not_downgraded() {
    let (provider, mut resolver) = browser(ScriptedIdentityProvider::new());
    let signed_in = provider
        .sign_in_permanent(Credentials::Federated {
            provider: "google".into(),
            subject: "42".into(),
            display_name: Some("Grace".into()),
        })
        .await
        .unwrap();

    let me = resolver.resolve().await;
    assert_eq!(me.uid, Some(signed_in.uid));
    assert!(!me.is_anonymous);
    assert_eq!(provider.anonymous_calls(), 0);
}

// ============================================================================
// Claims and feed
// ============================================================================

#[tokio::test]
async fn test_feed_follows_claims_and_hides_them_from_owner() {
    let store = Arc::new(MemoryStore::default());
    let (list, items) = seed_list(store.as_ref(), "owner", "birthday", &["Kettle", "Scarf"])
        .await
        .unwrap();
    let kettle = items[0].item_ref();

    let (_provider, mut resolver) = browser(ScriptedIdentityProvider::new());
    resolver.resolve().await;
    resolver.set_name("Alice").unwrap();
    let alice = resolver.me().actor().unwrap();

    let mut feed = ItemFeed::open(store.as_ref(), list.clone()).await.unwrap();
    let initial = feed.next().await.unwrap();
    assert_eq!(initial.len(), 2);
    assert_feed_consistent(initial);

    let engine = ClaimEngine::new(store.clone());
    engine.reserve(kettle, &alice).await.unwrap();

    let snapshot = feed
        .wait_until(|items| {
            items
                .iter()
                .any(|item| item.id == kettle.item_id && item.status() == ItemStatus::Reserved)
        })
        .await
        .unwrap();
    assert_feed_consistent(snapshot);

    let visitor_views = feed.views(&resolver.viewer_for(&list));
    let kettle_view = visitor_views
        .iter()
        .find(|view| view.item.id == kettle.item_id)
        .unwrap();
    assert_eq!(kettle_view.claimed_by.as_deref(), Some("Alice"));
    assert_eq!(
        kettle_view.actions.to_vec(),
        vec![ClaimAction::Unreserve, ClaimAction::Purchase]
    );

    let owner_views = feed.views(&Viewer::Owner(Uid::new("owner")));
    assert!(owner_views
        .iter()
        .all(|view| view.status() == ItemStatus::Available && view.claimed_by.is_none()));
}

#[tokio::test]
async fn test_round_trip_restores_own_reservation() {
    let store = Arc::new(MemoryStore::default());
    let (_list, items) = seed_list(store.as_ref(), "owner", "wedding", &["Vase"])
        .await
        .unwrap();
    let vase = items[0].item_ref();
    let engine = ClaimEngine::new(store);
    let alice = giftlist::Actor::new("u1", "Alice");
    let bob = giftlist::Actor::new("u2", "Bob");

    let reserved = engine.reserve(vase, &alice).await.unwrap();
    assert_claim_invariants(&reserved);

    let err = engine.purchase(vase, &bob).await.unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::ReservedBySomeoneElse));
    assert_eq!(err.category(), SafeErrorCategory::Rejected);

    let purchased = engine.purchase(vase, &alice).await.unwrap();
    assert_eq!(purchased.status(), ItemStatus::Purchased);
    assert_claim_invariants(&purchased);

    let undone = engine.unpurchase(vase, &alice).await.unwrap();
    assert_eq!(undone.status(), ItemStatus::Reserved);
    assert_eq!(undone.claim.reservation().unwrap().uid, Uid::new("u1"));
    assert_claim_invariants(&undone);

    // Bob still cannot take it until Alice lets go.
    let err = engine.reserve(vase, &bob).await.unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::AlreadyTaken));

    let released = engine.unreserve(vase, &alice).await.unwrap();
    assert_eq!(released.status(), ItemStatus::Available);
    assert_claim_invariants(&released);

    engine.reserve(vase, &bob).await.unwrap();
}

#[tokio::test]
async fn test_direct_purchase_undo_returns_to_available() {
    let store = Arc::new(MemoryStore::default());
    let (_list, items) = seed_list(store.as_ref(), "owner", "anniversary", &["Lamp"])
        .await
        .unwrap();
    let lamp = items[0].item_ref();
    let engine = ClaimEngine::new(store);
    let alice = giftlist::Actor::new("u1", "Alice");

    engine.purchase(lamp, &alice).await.unwrap();
    let undone = engine.unpurchase(lamp, &alice).await.unwrap();
    assert_eq!(undone.status(), ItemStatus::Available);
    assert_claim_invariants(&undone);
}

#[tokio::test]
async fn test_feed_settles_on_every_step_of_a_walkthrough() {
    let store = Arc::new(MemoryStore::default());
    let (list, items) = seed_list(store.as_ref(), "owner", "housewarming", &["Scarf"])
        .await
        .unwrap();
    let scarf = items[0].item_ref();
    let engine = ClaimEngine::new(store.clone());
    let alice = giftlist::Actor::new("u1", "Alice");

    let mut feed = ItemFeed::open(store.as_ref(), list).await.unwrap();
    feed.next().await.unwrap();

    let steps = [
        (ClaimAction::Reserve, ItemStatus::Reserved),
        (ClaimAction::Purchase, ItemStatus::Purchased),
        (ClaimAction::Unpurchase, ItemStatus::Reserved),
        (ClaimAction::Unreserve, ItemStatus::Available),
    ];
    for (action, expected) in steps {
        let committed = engine.apply(scarf, action, &alice).await.unwrap();
        assert_eq!(committed.status(), expected, "after {action}");

        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            feed.wait_until(|items| {
                items
                    .iter()
                    .any(|item| item.id == scarf.item_id && item.status() == expected)
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("feed never showed {expected:?} after {action}"));
        assert_feed_consistent(settled.unwrap());
    }
}

#[tokio::test]
async fn test_backend_failure_is_unavailable_and_retryable() {
    let memory = Arc::new(MemoryStore::default());
    let (_list, items) = seed_list(memory.as_ref(), "owner", "flaky", &["Lamp"])
        .await
        .unwrap();
    let lamp = items[0].item_ref();
    let store = Arc::new(FlakyStore::new(memory.clone()));
    let engine = ClaimEngine::new(store.clone());
    let alice = giftlist::Actor::new("u1", "Alice");

    store.set_unavailable(true);
    let err = engine.reserve(lamp, &alice).await.unwrap_err();
    assert!(matches!(err, ClaimError::StoreUnavailable(_)));
    assert!(err.category().is_retryable());

    store.set_unavailable(false);
    let item = engine.reserve(lamp, &alice).await.unwrap();
    assert_eq!(item.status(), ItemStatus::Reserved);
}
