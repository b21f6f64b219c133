//! The document store collaborator.
//!
//! Claim fields only change through [`DocumentStore::run_atomic`]: the store
//! hands the decision a consistent snapshot and commits the result only if
//! no other claim committed in between, re-running the decision on conflict.
//! Owner edits go through [`DocumentStore::update_item`], which patches
//! descriptive fields and leaves claim fields to whoever last committed them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::claim::Rejection;
use crate::error::StoreError;
use crate::item::{ClaimState, Item, ItemDraft, ItemEdit, ItemRef};
use crate::list::{List, NewList};

/// Live, ordered snapshots of one list's items. The first element is the
/// current state; later elements follow each change.
pub type ItemStream = BoxStream<'static, Vec<Item>>;

/// Pure claim decision run against a snapshot of the item.
pub type ClaimDecision<'a> = dyn Fn(&Item) -> Result<ClaimState, Rejection> + Send + Sync + 'a;

#[derive(Debug, Clone, PartialEq)]
pub enum AtomicOutcome {
    /// The new claim state was written; this is the item as committed.
    Committed(Item),
    /// The decision refused against the latest snapshot. Nothing was written.
    Rejected(Rejection),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a list. Fails with [`StoreError::SlugTaken`] if the slug is in use.
    async fn create_list(&self, new: NewList) -> Result<List, StoreError>;

    async fn list_by_slug(&self, slug: &str) -> Result<Option<List>, StoreError>;

    async fn list_by_id(&self, id: Uuid) -> Result<Option<List>, StoreError>;

    async fn create_item(&self, list_id: Uuid, draft: ItemDraft) -> Result<Item, StoreError>;

    async fn get_item(&self, item: ItemRef) -> Result<Option<Item>, StoreError>;

    /// Patch descriptive fields and stamp `updated_at`.
    async fn update_item(&self, item: ItemRef, edit: ItemEdit) -> Result<Item, StoreError>;

    async fn delete_item(&self, item: ItemRef) -> Result<(), StoreError>;

    /// Read-verify-write the item's claim state.
    ///
    /// Contention is retried internally; [`StoreError::Contention`] means the
    /// retry budget ran out.
    async fn run_atomic(
        &self,
        item: ItemRef,
        decide: &ClaimDecision<'_>,
    ) -> Result<AtomicOutcome, StoreError>;

    /// Subscribe to a list's items ordered by [`feed_order`](crate::item::feed_order).
    async fn subscribe(&self, list_id: Uuid) -> Result<ItemStream, StoreError>;
}
