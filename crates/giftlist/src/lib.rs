//! # Giftlist
//!
//! Shareable gift lists where visitors reserve and purchase items without
//! telling the list owner.
//!
//! ## Core Concepts
//!
//! Giftlist separates **deciding** a claim from **committing** it:
//! - [`decide`] = the transition table applied to one snapshot (pure, no IO)
//! - [`DocumentStore::run_atomic`] = snapshot, decide, commit-if-unchanged
//!
//! The key principle: **One Claim = One Item = One Transaction**.
//! Claims on different items are independent; claims on the same item are
//! linearized by the store.
//!
//! ## Architecture
//!
//! ```text
//! Visitor (browser session)
//!     │
//!     ▼ resolve()
//! IdentityResolver ── IdentityProvider + PreferenceStore
//!     │
//!     ▼ Me::actor()
//! ClaimEngine.apply(item, action, actor)
//!     │
//!     ▼ run_atomic(item, decide)
//! DocumentStore ──► snapshot ──► decide() ──► commit if unchanged
//!     │                              ▲            │ conflict
//!     │                              └────────────┘
//!     ▼ notify
//! ItemFeed (every subscriber of the list gets a new snapshot)
//!     │
//!     ▼ project()
//! ItemView { claimed_by, actions = visible_actions() }
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Available means unclaimed** - no reserver, no purchaser
//! 2. **Reserved means one reserver** - and no purchaser
//! 3. **Purchased means one purchaser** - who may keep their own reservation
//! 4. **No co-claiming** - one identity holds an item at a time
//! 5. **One table** - the engine and the UI read the same [`TRANSITIONS`]
//! 6. **Explicit identity** - the engine never reads an ambient session
//!
//! ## Guarantees
//!
//! - **Linearizable per item**: of two racing claimants exactly one wins
//! - **No partial writes**: a claim commits fully or not at all
//! - **Rejections write nothing**: `updated_at` only moves on commit
//!
//! Not guaranteed:
//! - Ordering across different items
//! - That the uid handed to the engine belongs to the caller. The storage
//!   layer's access rules must enforce the transition table again.
//!
//! ## Example
//!
//! ```ignore
//! use giftlist::{ClaimAction, ClaimEngine, GiftlistConfig, MemoryStore, NewList};
//! use std::sync::Arc;
//!
//! let config = GiftlistConfig::from_env();
//! let store = Arc::new(MemoryStore::new(&config));
//! let list = store.create_list(NewList { owner_uid, title, slug }).await?;
//! let item = store.create_item(list.id, ItemDraft::named("Kettle")).await?;
//!
//! let mut resolver = IdentityResolver::new(provider, prefs, ViewContext::PublicList, &config);
//! resolver.resolve().await;
//! resolver.set_name("Alice")?;
//!
//! let engine = ClaimEngine::new(store);
//! engine.apply(item.item_ref(), ClaimAction::Reserve, &resolver.me().actor()?).await?;
//! ```

// Core modules
mod claim;
mod config;
mod engine;
mod error;
mod feed;
mod identity;
mod item;
mod list;
mod memory;
mod store;
mod visibility;


// Concurrent claim races (test-only)
#[cfg(test)]
mod stress_tests;


// Re-export the transition table
pub use claim::{
    decide, rule, ClaimAction, Position, Rejection, Rule, UnknownAction, TRANSITIONS,
};

// Re-export configuration
pub use config::{GiftlistConfig, RetryPolicy};

// Re-export the engine (primary entry point)
pub use engine::ClaimEngine;

// Re-export error types
pub use error::{
    Categorizable, ClaimError, IdentityError, ItemError, ListError, SafeErrorCategory,
    StoreError,
};

// Re-export feed types
pub use feed::ItemFeed;

// Re-export identity types
pub use identity::{
    Actor, AuthIdentity, Credentials, IdentityProvider, IdentityResolver, LocalIdentityProvider,
    Me, MemoryPreferences, PreferenceStore, Uid, ViewContext, Viewer, VISITOR_NAME_KEY,
};

// Re-export document types
pub use item::{
    feed_order, Claim, ClaimRecord, ClaimState, Item, ItemDraft, ItemEdit, ItemRef, ItemStatus,
    Link, Price, Priority,
};
pub use list::{normalize_slug, List, NewList};

// Re-export store types
pub use memory::MemoryStore;
pub use store::{AtomicOutcome, ClaimDecision, DocumentStore, ItemStream};

// Re-export visibility policy
pub use visibility::{project, visible_actions, ActionSet, ItemView};

// Re-export commonly used external types
pub use async_trait::async_trait;
