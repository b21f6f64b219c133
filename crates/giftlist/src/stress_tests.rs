//! Concurrent claimants racing on the same items.

use std::sync::Arc;

use tokio::sync::Barrier;

use crate::claim::{ClaimAction, Rejection};
use crate::config::{GiftlistConfig, RetryPolicy};
use crate::engine::ClaimEngine;
use crate::error::ClaimError;
use crate::identity::{Actor, Uid};
use crate::item::{ItemDraft, ItemRef, ItemStatus};
use crate::list::NewList;
use crate::memory::MemoryStore;
use crate::store::DocumentStore;

async fn setup(items: usize) -> (ClaimEngine<MemoryStore>, Vec<ItemRef>) {
    // Enough retries that contention never outlasts the budget here.
    let config = GiftlistConfig::default().with_retry(RetryPolicy {
        max_attempts: 64,
        base_backoff_ms: 0,
    });
    let store = Arc::new(MemoryStore::new(&config));
    let list = store
        .create_list(NewList {
            owner_uid: Uid::new("owner"),
            title: "Stress".into(),
            slug: "stress".into(),
        })
        .await
        .unwrap();
    let mut refs = Vec::with_capacity(items);
    for index in 0..items {
        let item = store
            .create_item(list.id, ItemDraft::named(format!("item-{index}")))
            .await
            .unwrap();
        refs.push(item.item_ref());
    }
    (ClaimEngine::new(store), refs)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_reservers_exactly_one_wins() {
    for _ in 0..50 {
        let (engine, refs) = setup(1).await;
        let item = refs[0];
        let barrier = Arc::new(Barrier::new(2));

        let tasks: Vec<_> = [Actor::new("a", "Alice"), Actor::new("b", "Bob")]
            .into_iter()
            .map(|actor| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    (actor.uid.clone(), engine.reserve(item, &actor).await)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            let (uid, result) = task.await.unwrap();
            match result {
                Ok(_) => winners.push(uid),
                Err(ClaimError::InvalidTransition(Rejection::AlreadyTaken)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let item = engine.store().get_item(item).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::Reserved);
        assert_eq!(item.claim.reservation().unwrap().uid, winners[0]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_claimants_one_holder() {
    let (engine, refs) = setup(1).await;
    let item = refs[0];
    let claimants = 16;
    let barrier = Arc::new(Barrier::new(claimants));

    let tasks: Vec<_> = (0..claimants)
        .map(|index| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let actor = Actor::new(format!("u{index}"), format!("Guest {index}"));
            let action = if index % 2 == 0 {
                ClaimAction::Reserve
            } else {
                ClaimAction::Purchase
            };
            tokio::spawn(async move {
                barrier.wait().await;
                engine.apply(item, action, &actor).await
            })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(ClaimError::InvalidTransition(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    let item = engine.store().get_item(item).await.unwrap().unwrap();
    assert!(item.claim.check().is_ok());
    assert_ne!(item.status(), ItemStatus::Available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_workload_keeps_invariants() {
    let (engine, refs) = setup(4).await;
    let refs = Arc::new(refs);

    let tasks: Vec<_> = (0..8u64)
        .map(|seed| {
            let engine = engine.clone();
            let refs = refs.clone();
            tokio::spawn(async move {
                let mut rng = fastrand::Rng::with_seed(seed);
                let actor = Actor::new(format!("u{seed}"), format!("Guest {seed}"));
                for _ in 0..100 {
                    let item = refs[rng.usize(..refs.len())];
                    let action = ClaimAction::ALL[rng.usize(..ClaimAction::ALL.len())];
                    match engine.apply(item, action, &actor).await {
                        Ok(_) | Err(ClaimError::InvalidTransition(_)) => {}
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    for item in refs.iter() {
        let item = engine.store().get_item(*item).await.unwrap().unwrap();
        assert!(item.claim.check().is_ok());
    }
}
