//! Testing utilities for giftlist.
//!
//! - Fixtures that seed lists and items into any [`DocumentStore`]
//! - [`ScriptedIdentityProvider`] for bootstrap and failure scenarios
//! - [`FlakyStore`] to exercise transport failures on the claim path
//! - Invariant assertions for items and feed snapshots

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use giftlist::{
    feed_order, AtomicOutcome, AuthIdentity, ClaimDecision, ClaimRecord, ClaimState,
    Credentials, DocumentStore, IdentityError, IdentityProvider, Item, ItemDraft, ItemEdit,
    ItemRef, ItemStatus, ItemStream, List, LocalIdentityProvider, NewList, StoreError, Uid,
};
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Fixtures
// ============================================================================

/// Create a list owned by `owner` with one item per name.
pub async fn seed_list<S>(store: &S, owner: &str, slug: &str, items: &[&str]) -> Result<(List, Vec<Item>)>
where
    S: DocumentStore + ?Sized,
{
    let list = store
        .create_list(NewList {
            owner_uid: Uid::new(owner),
            title: format!("{slug} list"),
            slug: slug.to_string(),
        })
        .await
        .with_context(|| format!("creating list '{slug}'"))?;

    let mut created = Vec::with_capacity(items.len());
    for name in items {
        let item = store
            .create_item(list.id, ItemDraft::named(*name))
            .await
            .with_context(|| format!("creating item '{name}'"))?;
        created.push(item);
    }
    Ok((list, created))
}

// ============================================================================
// Assertions
// ============================================================================

/// Panics unless the item satisfies every claim invariant.
pub fn assert_claim_invariants(item: &Item) {
    let record = ClaimRecord::from(item.claim.clone());
    match item.status() {
        ItemStatus::Available => {
            assert!(record.reserved_by_uid.is_none(), "available item {} has a reserver", item.id);
            assert!(record.purchased_by_uid.is_none(), "available item {} has a purchaser", item.id);
        }
        ItemStatus::Reserved => {
            assert!(record.reserved_by_uid.is_some(), "reserved item {} has no reserver", item.id);
            assert!(record.purchased_by_uid.is_none(), "reserved item {} has a purchaser", item.id);
        }
        ItemStatus::Purchased => {
            assert!(record.purchased_by_uid.is_some(), "purchased item {} has no purchaser", item.id);
        }
    }
    if let Err(err) = item.claim.check() {
        panic!("item {}: {err}", item.id);
    }
    assert_eq!(
        ClaimState::try_from(record).ok().as_ref(),
        Some(&item.claim),
        "item {} does not survive its stored form",
        item.id
    );
}

/// Panics unless the snapshot is in feed order and every item is consistent.
pub fn assert_feed_consistent(items: &[Item]) {
    for pair in items.windows(2) {
        assert_ne!(
            feed_order(&pair[0], &pair[1]),
            std::cmp::Ordering::Greater,
            "feed out of order at {}",
            pair[1].id
        );
    }
    items.iter().for_each(assert_claim_invariants);
}

// ============================================================================
// Identity provider
// ============================================================================

/// Wraps [`LocalIdentityProvider`], counting anonymous bootstraps and
/// optionally failing them (e.g. storage blocked in a strict browser mode).
#[derive(Default)]
pub struct ScriptedIdentityProvider {
    inner: LocalIdentityProvider,
    fail_anonymous: AtomicBool,
    anonymous_calls: AtomicUsize,
}

impl ScriptedIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_anonymous() -> Self {
        let provider = Self::default();
        provider.fail_anonymous.store(true, Ordering::SeqCst);
        provider
    }

    pub fn set_fail_anonymous(&self, fail: bool) {
        self.fail_anonymous.store(fail, Ordering::SeqCst);
    }

    pub fn anonymous_calls(&self) -> usize {
        self.anonymous_calls.load(Ordering::SeqCst)
    }

    pub fn local(&self) -> &LocalIdentityProvider {
        &self.inner
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentityProvider {
    async fn current_identity(&self) -> Option<AuthIdentity> {
        self.inner.current_identity().await
    }

    async fn create_anonymous(&self) -> Result<AuthIdentity, IdentityError> {
        self.anonymous_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_anonymous.load(Ordering::SeqCst) {
            return Err(IdentityError::Provider("anonymous sign-in blocked".into()));
        }
        self.inner.create_anonymous().await
    }

    async fn sign_in_permanent(&self, credentials: Credentials) -> Result<AuthIdentity, IdentityError> {
        self.inner.sign_in_permanent(credentials).await
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.inner.sign_out().await
    }

    fn changes(&self) -> broadcast::Receiver<Option<AuthIdentity>> {
        self.inner.changes()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Delegates to another store, but can make claim transactions fail as if
/// the backend were unreachable.
pub struct FlakyStore<S: ?Sized> {
    unavailable: AtomicBool,
    inner: Arc<S>,
}

impl<S: ?Sized> FlakyStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            unavailable: AtomicBool::new(false),
            inner,
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S> DocumentStore for FlakyStore<S>
where
    S: DocumentStore + ?Sized,
{
    async fn create_list(&self, new: NewList) -> Result<List, StoreError> {
        self.inner.create_list(new).await
    }

    async fn list_by_slug(&self, slug: &str) -> Result<Option<List>, StoreError> {
        self.inner.list_by_slug(slug).await
    }

    async fn list_by_id(&self, id: Uuid) -> Result<Option<List>, StoreError> {
        self.inner.list_by_id(id).await
    }

    async fn create_item(&self, list_id: Uuid, draft: ItemDraft) -> Result<Item, StoreError> {
        self.inner.create_item(list_id, draft).await
    }

    async fn get_item(&self, item: ItemRef) -> Result<Option<Item>, StoreError> {
        self.inner.get_item(item).await
    }

    async fn update_item(&self, item: ItemRef, edit: ItemEdit) -> Result<Item, StoreError> {
        self.inner.update_item(item, edit).await
    }

    async fn delete_item(&self, item: ItemRef) -> Result<(), StoreError> {
        self.inner.delete_item(item).await
    }

    async fn run_atomic(
        &self,
        item: ItemRef,
        decide: &ClaimDecision<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset by peer".into()));
        }
        self.inner.run_atomic(item, decide).await
    }

    async fn subscribe(&self, list_id: Uuid) -> Result<ItemStream, StoreError> {
        self.inner.subscribe(list_id).await
    }
}
