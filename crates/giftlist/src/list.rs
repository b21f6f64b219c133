//! List documents and public slugs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ListError;
use crate::identity::Uid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: Uuid,
    pub owner_uid: Uid,
    pub title: String,
    /// Public address, unique across all lists.
    pub slug: String,
    /// Hide claim state from the owner's public view.
    pub anti_spoiler: bool,
    pub show_claimer_names: bool,
    pub theme: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl List {
    pub const DEFAULT_THEME: &'static str = "holiday";

    pub fn new(owner_uid: Uid, title: impl Into<String>, slug: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_uid,
            title: title.into(),
            slug,
            anti_spoiler: true,
            show_claimer_names: true,
            theme: Self::DEFAULT_THEME.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, uid: &Uid) -> bool {
        self.owner_uid == *uid
    }
}

/// Input for creating a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewList {
    pub owner_uid: Uid,
    pub title: String,
    pub slug: String,
}

/// Strip path decoration from a slug (`/l/xmas`, `l/xmas`, ` xmas `) and
/// validate what is left.
pub fn normalize_slug(raw: &str) -> Result<String, ListError> {
    let trimmed = raw.trim().trim_start_matches('/');
    let slug = trimmed.strip_prefix("l/").unwrap_or(trimmed).trim_matches('/');
    if slug.is_empty() {
        return Err(ListError::EmptySlug);
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ListError::InvalidSlug(slug.to_string()));
    }
    Ok(slug.to_string())
}
