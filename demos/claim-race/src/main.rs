//! Two visitors open the same public list and race to reserve one gift,
//! then one of them walks another gift through reserve, purchase,
//! unpurchase and unreserve while the owner and the other visitor watch the
//! feed.
//!
//! Runs on the in-memory store unless `GIFTLIST_DATABASE_URL` points at
//! PostgreSQL. Set `GIFTLIST_LOG_JSON=1` for JSON logs.

use std::sync::Arc;

use anyhow::{Context, Result};
use giftlist::{
    Actor, Categorizable, ClaimEngine, DocumentStore, GiftlistConfig, IdentityResolver,
    ItemDraft, ItemFeed, ItemStatus, LocalIdentityProvider, MemoryPreferences, MemoryStore,
    NewList, Price, Priority, Uid, ViewContext, Viewer,
};
use giftlist_postgres::PgDocumentStore;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

type Browser = IdentityResolver<LocalIdentityProvider, MemoryPreferences>;

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("GIFTLIST_LOG_JSON", false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn open_store(config: &GiftlistConfig) -> Result<Arc<dyn DocumentStore>> {
    match std::env::var("GIFTLIST_DATABASE_URL") {
        Ok(url) => {
            let pool = PgPool::connect(&url)
                .await
                .context("connecting to GIFTLIST_DATABASE_URL")?;
            let store = PgDocumentStore::new(pool, config);
            store.migrate().await?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new(config)))
        }
    }
}

/// A fresh browser landing on the public list and choosing a name.
async fn visitor(path: &str, name: &str, config: &GiftlistConfig) -> Result<Browser> {
    let mut browser = IdentityResolver::new(
        Arc::new(LocalIdentityProvider::new()),
        Arc::new(MemoryPreferences::new()),
        ViewContext::from_path(path),
        config,
    );
    browser.resolve().await;
    browser.set_name(name)?;
    Ok(browser)
}

fn log_views(feed: &ItemFeed, who: &str, viewer: &Viewer) {
    for view in feed.views(viewer) {
        info!(
            viewer = who,
            item = %view.item.name,
            status = view.status().as_str(),
            claimed_by = ?view.claimed_by,
            actions = ?view.actions,
            "feed"
        );
    }
}

async fn settle(feed: &mut ItemFeed, item: Uuid, status: ItemStatus) -> Result<()> {
    feed.wait_until(|items| {
        items
            .iter()
            .any(|candidate| candidate.id == item && candidate.status() == status)
    })
    .await
    .context("feed closed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = GiftlistConfig::from_env();
    let store = open_store(&config).await?;

    let list = store
        .create_list(NewList {
            owner_uid: Uid::new("demo-owner"),
            title: "Birthday".into(),
            slug: format!("birthday-{}", Uuid::new_v4().simple()),
        })
        .await?;
    let kettle = store
        .create_item(
            list.id,
            ItemDraft {
                name: "Kettle".into(),
                price: Some(Price::parse("39.90", Price::DEFAULT_CURRENCY)?),
                priority: Priority::High,
                ..ItemDraft::default()
            },
        )
        .await?;
    let scarf = store.create_item(list.id, ItemDraft::named("Scarf")).await?;
    info!(slug = %list.slug, "list seeded");

    let path = format!("/l/{}", list.slug);
    let alice = visitor(&path, "Alice", &config).await?;
    let bob = visitor(&path, "Bob", &config).await?;
    let owner = Viewer::Owner(list.owner_uid.clone());

    let mut feed = ItemFeed::open(store.as_ref(), list.clone()).await?;
    feed.next().await.context("feed closed")?;

    let engine = ClaimEngine::new(store.clone());

    // Race: both visitors reserve the kettle at once.
    let racers: Vec<Actor> = vec![alice.me().actor()?, bob.me().actor()?];
    let tasks: Vec<_> = racers
        .into_iter()
        .map(|actor| {
            let engine = engine.clone();
            let item = kettle.item_ref();
            tokio::spawn(async move {
                let result = engine.reserve(item, &actor).await;
                (actor, result)
            })
        })
        .collect();
    for task in tasks {
        let (actor, result) = task.await?;
        match result {
            Ok(_) => info!(visitor = %actor.name, "won the kettle"),
            Err(err) => info!(
                visitor = %actor.name,
                reason = %err,
                message = err.category().user_message(),
                "lost the kettle"
            ),
        }
    }
    settle(&mut feed, kettle.id, ItemStatus::Reserved).await?;
    log_views(&feed, "alice", &alice.viewer_for(&list));
    log_views(&feed, "bob", &bob.viewer_for(&list));
    log_views(&feed, "owner", &owner);

    // Owners cannot claim their own gifts.
    let owner_actor = Actor::new(list.owner_uid.clone(), "Owner");
    if let Err(err) = engine.reserve(scarf.item_ref(), &owner_actor).await {
        info!(reason = %err, "owner claim refused");
    }

    // Round trip on the scarf.
    let alice_actor = alice.me().actor()?;
    engine.reserve(scarf.item_ref(), &alice_actor).await?;
    settle(&mut feed, scarf.id, ItemStatus::Reserved).await?;
    log_views(&feed, "bob", &bob.viewer_for(&list));

    engine.purchase(scarf.item_ref(), &alice_actor).await?;
    settle(&mut feed, scarf.id, ItemStatus::Purchased).await?;
    log_views(&feed, "bob", &bob.viewer_for(&list));

    // Undoing the purchase falls back to Alice's standing reservation.
    engine.unpurchase(scarf.item_ref(), &alice_actor).await?;
    settle(&mut feed, scarf.id, ItemStatus::Reserved).await?;
    log_views(&feed, "bob", &bob.viewer_for(&list));

    engine.unreserve(scarf.item_ref(), &alice_actor).await?;
    settle(&mut feed, scarf.id, ItemStatus::Available).await?;
    log_views(&feed, "bob", &bob.viewer_for(&list));
    log_views(&feed, "owner", &owner);

    Ok(())
}
