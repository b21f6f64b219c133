//! PostgreSQL document store for giftlist.
//!
//! This crate provides a PostgreSQL implementation of the `DocumentStore`
//! trait from giftlist.
//!
//! # Features
//!
//! - Claim transactions under `SELECT ... FOR UPDATE` (one writer per item)
//! - A `claim_version` column bumped on every committed claim (and never by
//!   owner edits), read back by [`PgDocumentStore::claim_version`] to tell
//!   how many claims an item has seen
//! - Linear backoff retry on serialization failures and deadlocks
//! - Realtime feeds over `LISTEN giftlist_items` / `pg_notify`
//!
//! # Database Schema
//!
//! Applied by [`PgDocumentStore::migrate`]:
//!
//! ```sql
//! CREATE TABLE lists (
//!     id UUID PRIMARY KEY,
//!     owner_uid TEXT NOT NULL,
//!     title TEXT NOT NULL,
//!     slug TEXT NOT NULL UNIQUE,
//!     anti_spoiler BOOLEAN NOT NULL DEFAULT TRUE,
//!     show_claimer_names BOOLEAN NOT NULL DEFAULT TRUE,
//!     theme TEXT NOT NULL DEFAULT 'holiday',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE items (
//!     id UUID PRIMARY KEY,
//!     list_id UUID NOT NULL REFERENCES lists (id) ON DELETE CASCADE,
//!
//!     -- Descriptive fields (owner edits)
//!     name TEXT NOT NULL,
//!     price_minor BIGINT CHECK (price_minor >= 0),
//!     currency TEXT,
//!     image TEXT,
//!     color TEXT,
//!     size TEXT,
//!     note TEXT,
//!     priority TEXT NOT NULL DEFAULT 'medium',
//!     links JSONB NOT NULL DEFAULT '[]',
//!
//!     -- Claim fields (claim transactions only)
//!     status TEXT NOT NULL DEFAULT 'available',
//!     reserved_by_uid TEXT,
//!     reserved_by_name TEXT,
//!     reserved_at TIMESTAMPTZ,
//!     purchased_by_uid TEXT,
//!     purchased_by_name TEXT,
//!     purchased_at TIMESTAMPTZ,
//!     claim_version BIGINT NOT NULL DEFAULT 0,
//!
//!     -- Timestamps
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_items_list ON items (list_id, created_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use giftlist::{ClaimEngine, GiftlistConfig};
//! use giftlist_postgres::PgDocumentStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/giftlist").await?;
//! let store = PgDocumentStore::new(pool, &GiftlistConfig::from_env());
//! store.migrate().await?;
//!
//! let engine = ClaimEngine::new(Arc::new(store));
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use giftlist::{
    normalize_slug, AtomicOutcome, ClaimDecision, ClaimRecord, ClaimState, DocumentStore,
    GiftlistConfig, Item, ItemDraft, ItemEdit, ItemError, ItemRef, ItemStatus, ItemStream, Link,
    List, NewList, Price, Priority, RetryPolicy, StoreError, Uid,
};
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

/// Notification channel carrying the id of the list whose items changed.
pub const CHANNEL: &str = "giftlist_items";

/// Idempotent form of the schema in the crate docs.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lists (
    id UUID PRIMARY KEY,
    owner_uid TEXT NOT NULL,
    title TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    anti_spoiler BOOLEAN NOT NULL DEFAULT TRUE,
    show_claimer_names BOOLEAN NOT NULL DEFAULT TRUE,
    theme TEXT NOT NULL DEFAULT 'holiday',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS items (
    id UUID PRIMARY KEY,
    list_id UUID NOT NULL REFERENCES lists (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    price_minor BIGINT CHECK (price_minor >= 0),
    currency TEXT,
    image TEXT,
    color TEXT,
    size TEXT,
    note TEXT,
    priority TEXT NOT NULL DEFAULT 'medium',
    links JSONB NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'available',
    reserved_by_uid TEXT,
    reserved_by_name TEXT,
    reserved_at TIMESTAMPTZ,
    purchased_by_uid TEXT,
    purchased_by_name TEXT,
    purchased_at TIMESTAMPTZ,
    claim_version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_items_list ON items (list_id, created_at);
"#;

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL document store implementation.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgDocumentStore {
    /// Create a new PostgreSQL document store.
    ///
    /// Claim transactions retry conflicts under `config.retry`.
    pub fn new(pool: PgPool, config: &GiftlistConfig) -> Self {
        Self {
            pool,
            retry: config.retry,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// One claim transaction. Conflicts surface as a single-attempt
    /// [`StoreError::Contention`] for the caller to retry.
    async fn claim_once(
        &self,
        item: ItemRef,
        decide: &ClaimDecision<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT * FROM items WHERE id = $1 AND list_id = $2 FOR UPDATE")
            .bind(item.item_id)
            .bind(item.list_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or(StoreError::ItemNotFound(item))?;
        let snapshot = item_from_row(&row)?;

        // Dropping the transaction rolls it back and releases the row lock.
        let next = match decide(&snapshot) {
            Ok(next) => next,
            Err(reason) => return Ok(AtomicOutcome::Rejected(reason)),
        };

        let record = ClaimRecord::from(next);
        let row = sqlx::query(
            r#"
            UPDATE items
            SET status = $1,
                reserved_by_uid = $2,
                reserved_by_name = $3,
                reserved_at = $4,
                purchased_by_uid = $5,
                purchased_by_name = $6,
                purchased_at = $7,
                claim_version = claim_version + 1,
                updated_at = NOW()
            WHERE id = $8
            RETURNING *
            "#,
        )
        .bind(record.status.unwrap_or(ItemStatus::Available).as_str())
        .bind(record.reserved_by_uid)
        .bind(record.reserved_by_name)
        .bind(record.reserved_at)
        .bind(record.purchased_by_uid)
        .bind(record.purchased_by_name)
        .bind(record.purchased_at)
        .bind(item.item_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        notify(&mut tx, item.list_id).await?;
        tx.commit().await.map_err(backend)?;

        Ok(AtomicOutcome::Committed(item_from_row(&row)?))
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create_list(&self, new: NewList) -> Result<List, StoreError> {
        let slug = normalize_slug(&new.slug)?;
        let list = List::new(new.owner_uid, new.title, slug.clone(), Utc::now());

        let row = sqlx::query(
            r#"
            INSERT INTO lists (id, owner_uid, title, slug, anti_spoiler, show_claimer_names, theme, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(list.id)
        .bind(list.owner_uid.as_str())
        .bind(&list.title)
        .bind(&list.slug)
        .bind(list.anti_spoiler)
        .bind(list.show_claimer_names)
        .bind(&list.theme)
        .bind(list.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match sql_state(&err).as_deref() {
            Some(UNIQUE_VIOLATION) => StoreError::SlugTaken(slug),
            _ => backend(err),
        })?;

        let list = list_from_row(&row)?;
        debug!(list_id = %list.id, slug = %list.slug, "list created");
        Ok(list)
    }

    async fn list_by_slug(&self, slug: &str) -> Result<Option<List>, StoreError> {
        let Ok(slug) = normalize_slug(slug) else {
            return Ok(None);
        };
        sqlx::query("SELECT * FROM lists WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(|row| list_from_row(&row))
            .transpose()
    }

    async fn list_by_id(&self, id: Uuid) -> Result<Option<List>, StoreError> {
        sqlx::query("SELECT * FROM lists WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(|row| list_from_row(&row))
            .transpose()
    }

    async fn create_item(&self, list_id: Uuid, draft: ItemDraft) -> Result<Item, StoreError> {
        let item = Item::from_draft(list_id, draft, Utc::now());
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query(
            r#"
            INSERT INTO items (id, list_id, name, price_minor, currency, image, color, size, note, priority, links, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING *
            "#,
        )
        .bind(item.id)
        .bind(item.list_id)
        .bind(&item.name)
        .bind(price_minor(&item)?)
        .bind(item.price.as_ref().map(|price| price.currency.as_str()))
        .bind(&item.image)
        .bind(&item.color)
        .bind(&item.size)
        .bind(&item.note)
        .bind(item.priority.as_str())
        .bind(Json(&item.links))
        .bind(item.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match sql_state(&err).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => StoreError::ListNotFound(list_id),
            _ => backend(err),
        })?;

        notify(&mut tx, list_id).await?;
        tx.commit().await.map_err(backend)?;
        item_from_row(&row)
    }

    async fn get_item(&self, item: ItemRef) -> Result<Option<Item>, StoreError> {
        sqlx::query("SELECT * FROM items WHERE id = $1 AND list_id = $2")
            .bind(item.item_id)
            .bind(item.list_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(|row| item_from_row(&row))
            .transpose()
    }

    /// Patch descriptive columns. Claim columns and `claim_version` are not
    /// written, so an edit never invalidates a claim in flight.
    async fn update_item(&self, item: ItemRef, edit: ItemEdit) -> Result<Item, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT * FROM items WHERE id = $1 AND list_id = $2 FOR UPDATE")
            .bind(item.item_id)
            .bind(item.list_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or(StoreError::ItemNotFound(item))?;
        let mut edited = item_from_row(&row)?;
        edited.apply_edit(edit, Utc::now());

        let row = sqlx::query(
            r#"
            UPDATE items
            SET name = $1,
                price_minor = $2,
                currency = $3,
                image = $4,
                color = $5,
                size = $6,
                note = $7,
                priority = $8,
                links = $9,
                updated_at = $10
            WHERE id = $11
            RETURNING *
            "#,
        )
        .bind(&edited.name)
        .bind(price_minor(&edited)?)
        .bind(edited.price.as_ref().map(|price| price.currency.as_str()))
        .bind(&edited.image)
        .bind(&edited.color)
        .bind(&edited.size)
        .bind(&edited.note)
        .bind(edited.priority.as_str())
        .bind(Json(&edited.links))
        .bind(edited.updated_at)
        .bind(item.item_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        notify(&mut tx, item.list_id).await?;
        tx.commit().await.map_err(backend)?;
        item_from_row(&row)
    }

    async fn delete_item(&self, item: ItemRef) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let result = sqlx::query("DELETE FROM items WHERE id = $1 AND list_id = $2")
            .bind(item.item_id)
            .bind(item.list_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item));
        }

        notify(&mut tx, item.list_id).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    /// Run a claim transaction, retrying serialization failures and
    /// deadlocks with linear backoff.
    async fn run_atomic(
        &self,
        item: ItemRef,
        decide: &ClaimDecision<'_>,
    ) -> Result<AtomicOutcome, StoreError> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
            }
            match self.claim_once(item, decide).await {
                Err(StoreError::Contention { .. }) => {
                    debug!(%item, attempt, "claim transaction conflicted, retrying");
                }
                outcome => return outcome,
            }
        }
        Err(StoreError::Contention { attempts })
    }

    async fn subscribe(&self, list_id: Uuid) -> Result<ItemStream, StoreError> {
        if self.list_by_id(list_id).await?.is_none() {
            return Err(StoreError::ListNotFound(list_id));
        }

        // Listen before the first snapshot so no change falls in between.
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(backend)?;
        listener.listen(CHANNEL).await.map_err(backend)?;
        let initial = fetch_items(&self.pool, list_id).await?;

        let updates = stream::unfold(
            (listener, self.pool.clone()),
            move |(mut listener, pool)| async move {
                loop {
                    match listener.try_recv().await {
                        Ok(Some(notification))
                            if notification.payload().parse::<Uuid>().ok() == Some(list_id) =>
                        {
                            break
                        }
                        Ok(Some(_)) => continue,
                        // The connection dropped and notifications may have
                        // been missed; the next call reconnects.
                        Ok(None) => {
                            debug!(%list_id, "feed listener reconnecting, re-snapshotting");
                            break;
                        }
                        Err(err) => {
                            warn!(%list_id, error = %err, "feed listener failed");
                            return None;
                        }
                    }
                }
                match fetch_items(&pool, list_id).await {
                    Ok(items) => Some((items, (listener, pool))),
                    Err(err) => {
                        warn!(%list_id, error = %err, "feed snapshot failed");
                        None
                    }
                }
            },
        );

        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }
}

/// Utility functions for list maintenance.
impl PgDocumentStore {
    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Number of claims committed on an item, `None` if it does not exist.
    ///
    /// Row locks, not this counter, serialize claims here; it is kept for
    /// operators and for parity with optimistic backends.
    pub async fn claim_version(&self, item: ItemRef) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT claim_version FROM items WHERE id = $1 AND list_id = $2")
            .bind(item.item_id)
            .bind(item.list_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| row.try_get("claim_version"))
            .transpose()?)
    }

    /// Count a list's items by claim status.
    ///
    /// Meant for operators; visitors and owners read the feed.
    pub async fn claim_stats(&self, list_id: Uuid) -> anyhow::Result<ClaimStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'available') as available,
                COUNT(*) FILTER (WHERE status = 'reserved') as reserved,
                COUNT(*) FILTER (WHERE status = 'purchased') as purchased
            FROM items
            WHERE list_id = $1
            "#,
        )
        .bind(list_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ClaimStats {
            available: row.try_get("available")?,
            reserved: row.try_get("reserved")?,
            purchased: row.try_get("purchased")?,
        })
    }
}

/// Claim statistics for one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimStats {
    pub available: i64,
    pub reserved: i64,
    pub purchased: i64,
}

async fn notify(tx: &mut Transaction<'_, Postgres>, list_id: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL)
        .bind(list_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(())
}

async fn fetch_items(pool: &PgPool, list_id: Uuid) -> Result<Vec<Item>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT *
        FROM items
        WHERE list_id = $1
        ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                 created_at ASC,
                 id ASC
        "#,
    )
    .bind(list_id)
    .fetch_all(pool)
    .await
    .map_err(backend)?;

    rows.iter().map(item_from_row).collect()
}

fn sql_state(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// Map a driver error. Conflicts become a single-attempt contention so the
/// claim loop can retry them.
fn backend(err: sqlx::Error) -> StoreError {
    match sql_state(&err).as_deref() {
        Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
            StoreError::Contention { attempts: 1 }
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn corrupt(id: Uuid, err: ItemError) -> StoreError {
    StoreError::Backend(format!("item {id} is corrupt: {err}"))
}

fn price_minor(item: &Item) -> Result<Option<i64>, StoreError> {
    item.price
        .as_ref()
        .map(|price| i64::try_from(price.minor_units))
        .transpose()
        .map_err(|_| corrupt(item.id, ItemError::InvalidPrice(item.name.clone())))
}

fn list_from_row(row: &PgRow) -> Result<List, StoreError> {
    Ok(List {
        id: row.try_get("id").map_err(backend)?,
        owner_uid: Uid::new(row.try_get::<String, _>("owner_uid").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        slug: row.try_get("slug").map_err(backend)?,
        anti_spoiler: row.try_get("anti_spoiler").map_err(backend)?,
        show_claimer_names: row.try_get("show_claimer_names").map_err(backend)?,
        theme: row.try_get("theme").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, StoreError> {
    let id: Uuid = row.try_get("id").map_err(backend)?;

    let price_minor: Option<i64> = row.try_get("price_minor").map_err(backend)?;
    let currency: Option<String> = row.try_get("currency").map_err(backend)?;
    let price = match price_minor {
        Some(minor) => Some(Price {
            minor_units: u64::try_from(minor)
                .map_err(|_| corrupt(id, ItemError::InvalidPrice(minor.to_string())))?,
            currency: currency.unwrap_or_else(|| Price::DEFAULT_CURRENCY.to_string()),
        }),
        None => None,
    };

    let priority: String = row.try_get("priority").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    let record = ClaimRecord {
        status: Some(ItemStatus::from_str(&status).map_err(|err| corrupt(id, err))?),
        reserved_by_uid: row.try_get("reserved_by_uid").map_err(backend)?,
        reserved_by_name: row.try_get("reserved_by_name").map_err(backend)?,
        reserved_at: row.try_get("reserved_at").map_err(backend)?,
        purchased_by_uid: row.try_get("purchased_by_uid").map_err(backend)?,
        purchased_by_name: row.try_get("purchased_by_name").map_err(backend)?,
        purchased_at: row.try_get("purchased_at").map_err(backend)?,
    };
    let Json(links): Json<Vec<Link>> = row.try_get("links").map_err(backend)?;

    Ok(Item {
        id,
        list_id: row.try_get("list_id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        price,
        image: row.try_get("image").map_err(backend)?,
        color: row.try_get("color").map_err(backend)?,
        size: row.try_get("size").map_err(backend)?,
        note: row.try_get("note").map_err(backend)?,
        priority: Priority::from_str(&priority).map_err(|err| corrupt(id, err))?,
        links,
        claim: ClaimState::try_from(record).map_err(|err| corrupt(id, err))?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}
