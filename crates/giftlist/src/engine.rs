//! The claim engine.
//!
//! The engine is the only writer of claim fields. It checks the caller's
//! identity, then hands the store a pure decision built from the transition
//! table; the store owns snapshots, conflict detection and retries.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::claim::{decide, ClaimAction, Rejection};
use crate::error::ClaimError;
use crate::identity::Actor;
use crate::item::{Item, ItemRef};
use crate::store::{AtomicOutcome, DocumentStore};

pub struct ClaimEngine<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for ClaimEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> ClaimEngine<S>
where
    S: DocumentStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply `action` to `item` on behalf of `actor`, returning the item as
    /// committed.
    ///
    /// Exactly one of several concurrent conflicting callers succeeds; the
    /// others see the state the winner produced and get
    /// [`ClaimError::InvalidTransition`].
    pub async fn apply(
        &self,
        item: ItemRef,
        action: ClaimAction,
        actor: &Actor,
    ) -> Result<Item, ClaimError> {
        if !actor.is_ready() {
            return Err(ClaimError::IdentityNotReady);
        }

        let list = self
            .store
            .list_by_id(item.list_id)
            .await?
            .ok_or(ClaimError::ItemNotFound(item))?;
        if list.is_owned_by(&actor.uid) {
            debug!(%item, %action, uid = %actor.uid, "owner tried to claim");
            return Err(ClaimError::InvalidTransition(Rejection::OwnerCannotClaim));
        }

        let decision = |current: &Item| decide(&current.claim, action, actor, Utc::now());
        match self.store.run_atomic(item, &decision).await {
            Ok(AtomicOutcome::Committed(updated)) => {
                info!(
                    %item,
                    %action,
                    uid = %actor.uid,
                    status = updated.status().as_str(),
                    "claim committed"
                );
                Ok(updated)
            }
            Ok(AtomicOutcome::Rejected(reason)) => {
                debug!(%item, %action, uid = %actor.uid, %reason, "claim rejected");
                Err(ClaimError::InvalidTransition(reason))
            }
            Err(err) => {
                warn!(%item, %action, error = %err, "claim failed");
                Err(err.into())
            }
        }
    }

    pub async fn reserve(&self, item: ItemRef, actor: &Actor) -> Result<Item, ClaimError> {
        self.apply(item, ClaimAction::Reserve, actor).await
    }

    pub async fn unreserve(&self, item: ItemRef, actor: &Actor) -> Result<Item, ClaimError> {
        self.apply(item, ClaimAction::Unreserve, actor).await
    }

    pub async fn purchase(&self, item: ItemRef, actor: &Actor) -> Result<Item, ClaimError> {
        self.apply(item, ClaimAction::Purchase, actor).await
    }

    pub async fn unpurchase(&self, item: ItemRef, actor: &Actor) -> Result<Item, ClaimError> {
        self.apply(item, ClaimAction::Unpurchase, actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Uid;
    use crate::item::{ItemDraft, ItemStatus};
    use crate::list::NewList;
    use crate::memory::MemoryStore;

    async fn setup() -> (ClaimEngine<MemoryStore>, ItemRef) {
        let store = Arc::new(MemoryStore::default());
        let list = store
            .create_list(NewList {
                owner_uid: Uid::new("owner"),
                title: "Housewarming".into(),
                slug: "housewarming".into(),
            })
            .await
            .unwrap();
        let item = store
            .create_item(list.id, ItemDraft::named("Plant"))
            .await
            .unwrap();
        (ClaimEngine::new(store), item.item_ref())
    }

    #[tokio::test]
    async fn test_reserve_records_claimant() {
        let (engine, item) = setup().await;
        let updated = engine
            .reserve(item, &Actor::new("u1", "Alice"))
            .await
            .unwrap();

        assert_eq!(updated.status(), ItemStatus::Reserved);
        let reservation = updated.claim.reservation().unwrap();
        assert_eq!(reservation.uid, Uid::new("u1"));
        assert_eq!(reservation.name, "Alice");
        assert!(updated.claim.purchase().is_none());
    }

    #[tokio::test]
    async fn test_unready_actor_is_refused_before_store() {
        let (engine, item) = setup().await;
        let err = engine.reserve(item, &Actor::new("u1", "")).await.unwrap_err();
        assert!(matches!(err, ClaimError::IdentityNotReady));
        let err = engine.reserve(item, &Actor::new("", "Alice")).await.unwrap_err();
        assert!(matches!(err, ClaimError::IdentityNotReady));
    }

    #[tokio::test]
    async fn test_owner_cannot_claim() {
        let (engine, item) = setup().await;
        let err = engine
            .purchase(item, &Actor::new("owner", "Olivia"))
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::OwnerCannotClaim));
    }

    #[tokio::test]
    async fn test_round_trips() {
        let (engine, item) = setup().await;
        let alice = Actor::new("u1", "Alice");

        engine.reserve(item, &alice).await.unwrap();
        engine.purchase(item, &alice).await.unwrap();
        let undone = engine.unpurchase(item, &alice).await.unwrap();
        assert_eq!(undone.status(), ItemStatus::Reserved);
        assert_eq!(undone.claim.reservation().unwrap().uid, alice.uid);

        engine.unreserve(item, &alice).await.unwrap();
        engine.purchase(item, &alice).await.unwrap();
        let undone = engine.unpurchase(item, &alice).await.unwrap();
        assert_eq!(undone.status(), ItemStatus::Available);
    }

    #[tokio::test]
    async fn test_other_visitor_boundaries() {
        let (engine, item) = setup().await;
        let alice = Actor::new("u1", "Alice");
        let bob = Actor::new("u2", "Bob");
        engine.reserve(item, &alice).await.unwrap();

        let err = engine.purchase(item, &bob).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::ReservedBySomeoneElse));
        let err = engine.unreserve(item, &bob).await.unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::NotYourReservation));
    }

    #[tokio::test]
    async fn test_deleted_item_is_not_found() {
        let (engine, item) = setup().await;
        engine.store().delete_item(item).await.unwrap();
        let err = engine
            .reserve(item, &Actor::new("u1", "Alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::ItemNotFound(missing) if missing == item));
    }
}
