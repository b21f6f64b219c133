//! In-memory [`DocumentStore`].
//!
//! Each item carries a claim version. `run_atomic` reads a snapshot without
//! holding any lock, runs the decision, then commits only if the version is
//! unchanged, holding the item's shard lock for the compare-and-set. Owner
//! edits do not bump the claim version: they never touch claim fields, so
//! there is nothing for a racing claim to lose.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;
use uuid::Uuid;

use crate::config::{GiftlistConfig, RetryPolicy};
use crate::error::StoreError;
use crate::item::{feed_order, Item, ItemDraft, ItemEdit, ItemRef};
use crate::list::{normalize_slug, List, NewList};
use crate::store::{AtomicOutcome, ClaimDecision, DocumentStore, ItemStream};

struct StoredItem {
    item: Item,
    claim_version: u64,
}

struct Inner {
    lists: DashMap<Uuid, List>,
    slugs: DashMap<String, Uuid>,
    items: DashMap<Uuid, StoredItem>,
    /// Carries the id of the list whose items changed.
    changes: broadcast::Sender<Uuid>,
    retry: RetryPolicy,
}

impl Inner {
    fn snapshot(&self, list_id: Uuid) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .items
            .iter()
            .filter(|entry| entry.item.list_id == list_id)
            .map(|entry| entry.item.clone())
            .collect();
        items.sort_by(feed_order);
        items
    }

    fn notify(&self, list_id: Uuid) {
        // Nobody listening is fine.
        let _ = self.changes.send(list_id);
    }
}

/// Cheaply cloneable handle; clones share the same documents.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(config: &GiftlistConfig) -> Self {
        let (changes, _) = broadcast::channel(config.feed_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                lists: DashMap::new(),
                slugs: DashMap::new(),
                items: DashMap::new(),
                changes,
                retry: config.retry,
            }),
        }
    }

    fn missing(item: ItemRef) -> StoreError {
        StoreError::ItemNotFound(item)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&GiftlistConfig::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_list(&self, new: NewList) -> Result<List, StoreError> {
        let slug = normalize_slug(&new.slug)?;
        let list = List::new(new.owner_uid, new.title, slug.clone(), Utc::now());
        match self.inner.slugs.entry(slug) {
            Entry::Occupied(taken) => return Err(StoreError::SlugTaken(taken.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(list.id);
            }
        }
        self.inner.lists.insert(list.id, list.clone());
        debug!(list_id = %list.id, slug = %list.slug, "list created");
        Ok(list)
    }

    async fn list_by_slug(&self, slug: &str) -> Result<Option<List>, StoreError> {
        let Ok(slug) = normalize_slug(slug) else {
            return Ok(None);
        };
        let Some(id) = self.inner.slugs.get(&slug).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.inner.lists.get(&id).map(|list| list.clone()))
    }

    async fn list_by_id(&self, id: Uuid) -> Result<Option<List>, StoreError> {
        Ok(self.inner.lists.get(&id).map(|list| list.clone()))
    }

    async fn create_item(&self, list_id: Uuid, draft: ItemDraft) -> Result<Item, StoreError> {
        if !self.inner.lists.contains_key(&list_id) {
            return Err(StoreError::ListNotFound(list_id));
        }
        let item = Item::from_draft(list_id, draft, Utc::now());
        self.inner.items.insert(
            item.id,
            StoredItem {
                item: item.clone(),
                claim_version: 0,
            },
        );
        self.inner.notify(list_id);
        Ok(item)
    }

    async fn get_item(&self, item: ItemRef) -> Result<Option<Item>, StoreError> {
        Ok(self
            .inner
            .items
            .get(&item.item_id)
            .filter(|stored| stored.item.list_id == item.list_id)
            .map(|stored| stored.item.clone()))
    }

    async fn update_item(&self, item: ItemRef, edit: ItemEdit) -> Result<Item, StoreError> {
        let updated = {
            let mut stored = self
                .inner
                .items
                .get_mut(&item.item_id)
                .filter(|stored| stored.item.list_id == item.list_id)
                .ok_or_else(|| Self::missing(item))?;
            stored.item.apply_edit(edit, Utc::now());
            stored.item.clone()
        };
        self.inner.notify(item.list_id);
        Ok(updated)
    }

    async fn delete_item(&self, item: ItemRef) -> Result<(), StoreError> {
        self.inner
            .items
            .remove_if(&item.item_id, |_, stored| stored.item.list_id == item.list_id)
            .ok_or_else(|| Self::missing(item))?;
        self.inner.notify(item.list_id);
        Ok(())
    }

    async fn run_atomic(
        &self,
        item: ItemRef,
        decide: &ClaimDecision<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        let retry = self.inner.retry;
        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            }

            let (snapshot, read_version) = self
                .inner
                .items
                .get(&item.item_id)
                .filter(|stored| stored.item.list_id == item.list_id)
                .map(|stored| (stored.item.clone(), stored.claim_version))
                .ok_or_else(|| Self::missing(item))?;

            let next = match decide(&snapshot) {
                Ok(next) => next,
                Err(reason) => return Ok(AtomicOutcome::Rejected(reason)),
            };

            let committed = {
                let mut stored = self
                    .inner
                    .items
                    .get_mut(&item.item_id)
                    .ok_or_else(|| Self::missing(item))?;
                if stored.claim_version == read_version {
                    stored.item.claim = next;
                    stored.item.updated_at = Utc::now();
                    stored.claim_version += 1;
                    Some(stored.item.clone())
                } else {
                    None
                }
            };

            match committed {
                Some(updated) => {
                    self.inner.notify(item.list_id);
                    return Ok(AtomicOutcome::Committed(updated));
                }
                None => debug!(%item, attempt, "claim commit conflicted, retrying"),
            }
        }
        Err(StoreError::Contention {
            attempts: retry.max_attempts,
        })
    }

    async fn subscribe(&self, list_id: Uuid) -> Result<ItemStream, StoreError> {
        if !self.inner.lists.contains_key(&list_id) {
            return Err(StoreError::ListNotFound(list_id));
        }
        // Subscribe before the first snapshot so no change falls in between.
        let changes = self.inner.changes.subscribe();
        let inner = self.inner.clone();
        let initial = inner.snapshot(list_id);

        let updates = stream::unfold((changes, inner), move |(mut changes, inner)| async move {
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == list_id => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(%list_id, skipped, "feed lagged, re-snapshotting");
                        break;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
            let items = inner.snapshot(list_id);
            Some((items, (changes, inner)))
        });

        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }
}
