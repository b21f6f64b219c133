//! Item documents.
//!
//! An item's claim state is an enum, so the "available means nobody holds
//! it" style invariants hold by construction. The stored form is the flat
//! camelCase record (`status`, `reservedByUid`, ...) that the realtime feed
//! and the PostgreSQL rows carry; decoding rejects records that break the
//! invariants instead of silently repairing them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ItemError;
use crate::identity::{Actor, Uid};

/// Addresses one item inside one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub list_id: Uuid,
    pub item_id: Uuid,
}

impl ItemRef {
    pub fn new(list_id: Uuid, item_id: Uuid) -> Self {
        Self { list_id, item_id }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.list_id, self.item_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Available,
    Reserved,
    Purchased,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Purchased => "purchased",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(ItemStatus::Available),
            "reserved" => Ok(ItemStatus::Reserved),
            "purchased" => Ok(ItemStatus::Purchased),
            _ => Err(ItemError::InconsistentClaim("unknown status")),
        }
    }
}

/// Who claimed an item, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub uid: Uid,
    pub name: String,
    pub at: DateTime<Utc>,
}

impl Claim {
    pub fn new(actor: &Actor, at: DateTime<Utc>) -> Self {
        Self {
            uid: actor.uid.clone(),
            name: actor.name.clone(),
            at,
        }
    }
}

/// The invariant-bearing part of an item.
///
/// A purchase may keep the purchaser's own earlier reservation so that
/// undoing the purchase can fall back to it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ClaimRecord", into = "ClaimRecord")]
pub enum ClaimState {
    #[default]
    Available,
    Reserved {
        reservation: Claim,
    },
    Purchased {
        purchase: Claim,
        reservation: Option<Claim>,
    },
}

impl ClaimState {
    pub fn status(&self) -> ItemStatus {
        match self {
            ClaimState::Available => ItemStatus::Available,
            ClaimState::Reserved { .. } => ItemStatus::Reserved,
            ClaimState::Purchased { .. } => ItemStatus::Purchased,
        }
    }

    pub fn reservation(&self) -> Option<&Claim> {
        match self {
            ClaimState::Available => None,
            ClaimState::Reserved { reservation } => Some(reservation),
            ClaimState::Purchased { reservation, .. } => reservation.as_ref(),
        }
    }

    pub fn purchase(&self) -> Option<&Claim> {
        match self {
            ClaimState::Purchased { purchase, .. } => Some(purchase),
            _ => None,
        }
    }

    /// Checks the one invariant the enum cannot express: a retained
    /// reservation must belong to the purchaser.
    pub fn check(&self) -> Result<(), ItemError> {
        if let ClaimState::Purchased {
            purchase,
            reservation: Some(reservation),
        } = self
        {
            if reservation.uid != purchase.uid {
                return Err(ItemError::InconsistentClaim(
                    "reservation and purchase held by different identities",
                ));
            }
        }
        Ok(())
    }
}

/// Flat storage form of [`ClaimState`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub status: Option<ItemStatus>,
    pub reserved_by_uid: Option<String>,
    pub reserved_by_name: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub purchased_by_uid: Option<String>,
    pub purchased_by_name: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
}

/// A claim is all of uid, name and timestamp, or none of them.
fn claim_from_parts(
    uid: Option<String>,
    name: Option<String>,
    at: Option<DateTime<Utc>>,
    partial: &'static str,
) -> Result<Option<Claim>, ItemError> {
    match (uid, name, at) {
        (Some(uid), Some(name), Some(at)) => Ok(Some(Claim {
            uid: Uid::new(uid),
            name,
            at,
        })),
        (None, None, None) => Ok(None),
        _ => Err(ItemError::InconsistentClaim(partial)),
    }
}

impl TryFrom<ClaimRecord> for ClaimState {
    type Error = ItemError;

    fn try_from(record: ClaimRecord) -> Result<Self, Self::Error> {
        let reservation = claim_from_parts(
            record.reserved_by_uid,
            record.reserved_by_name,
            record.reserved_at,
            "reservation is missing its uid, name or timestamp",
        )?;
        let purchase = claim_from_parts(
            record.purchased_by_uid,
            record.purchased_by_name,
            record.purchased_at,
            "purchase is missing its uid, name or timestamp",
        )?;

        let state = match (record.status.unwrap_or(ItemStatus::Available), reservation, purchase) {
            (ItemStatus::Available, None, None) => ClaimState::Available,
            (ItemStatus::Available, _, _) => {
                return Err(ItemError::InconsistentClaim("available item has a claimant"))
            }
            (ItemStatus::Reserved, Some(reservation), None) => ClaimState::Reserved { reservation },
            (ItemStatus::Reserved, None, _) => {
                return Err(ItemError::InconsistentClaim("reserved item has no reserver"))
            }
            (ItemStatus::Reserved, Some(_), Some(_)) => {
                return Err(ItemError::InconsistentClaim("reserved item has a purchaser"))
            }
            (ItemStatus::Purchased, reservation, Some(purchase)) => ClaimState::Purchased {
                purchase,
                reservation,
            },
            (ItemStatus::Purchased, _, None) => {
                return Err(ItemError::InconsistentClaim("purchased item has no purchaser"))
            }
        };
        state.check()?;
        Ok(state)
    }
}

impl From<ClaimState> for ClaimRecord {
    fn from(state: ClaimState) -> Self {
        let mut record = ClaimRecord {
            status: Some(state.status()),
            ..ClaimRecord::default()
        };
        if let Some(reservation) = state.reservation() {
            record.reserved_by_uid = Some(reservation.uid.to_string());
            record.reserved_by_name = Some(reservation.name.clone());
            record.reserved_at = Some(reservation.at);
        }
        if let Some(purchase) = state.purchase() {
            record.purchased_by_uid = Some(purchase.uid.to_string());
            record.purchased_by_name = Some(purchase.name.clone());
            record.purchased_at = Some(purchase.at);
        }
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = ItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(ItemError::UnknownPriority(other.to_string())),
        }
    }
}

/// A non-negative price in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub minor_units: u64,
    pub currency: String,
}

impl Price {
    pub const DEFAULT_CURRENCY: &'static str = "USD";

    /// Parse owner input such as `"24.99"`, `"5"`, `"5."` or `".5"`.
    pub fn parse(input: &str, currency: &str) -> Result<Self, ItemError> {
        let invalid = || ItemError::InvalidPrice(input.to_string());
        let trimmed = input.trim();
        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty())
            || !all_digits(whole)
            || !all_digits(fraction)
            || fraction.len() > 2
        {
            return Err(invalid());
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let cents: u64 = format!("{fraction:0<2}").parse().map_err(|_| invalid())?;
        let minor_units = whole
            .checked_mul(100)
            .and_then(|units| units.checked_add(cents))
            .ok_or_else(invalid)?;

        Ok(Self {
            minor_units,
            currency: currency.to_string(),
        })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.minor_units / 100,
            self.minor_units % 100,
            self.currency
        )
    }
}

/// Where an item can be bought.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Free-form storefront label such as `amazon`, `etsy` or `other`.
    pub platform: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: Uuid,
    pub list_id: Uuid,
    pub name: String,
    pub price: Option<Price>,
    pub image: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub note: Option<String>,
    pub priority: Priority,
    pub links: Vec<Link>,
    #[serde(flatten)]
    pub claim: ClaimState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.list_id, self.id)
    }

    pub fn status(&self) -> ItemStatus {
        self.claim.status()
    }

    /// Build a fresh, unclaimed item from an owner's draft.
    pub fn from_draft(list_id: Uuid, draft: ItemDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            list_id,
            name: draft.name,
            price: draft.price,
            image: draft.image,
            color: draft.color,
            size: draft.size,
            note: draft.note,
            priority: draft.priority,
            links: draft.links,
            claim: ClaimState::Available,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an owner edit. Claim fields are untouched.
    pub fn apply_edit(&mut self, edit: ItemEdit, now: DateTime<Utc>) {
        if let Some(name) = edit.name {
            self.name = name;
        }
        if let Some(price) = edit.price {
            self.price = price;
        }
        if let Some(image) = edit.image {
            self.image = image;
        }
        if let Some(color) = edit.color {
            self.color = color;
        }
        if let Some(size) = edit.size {
            self.size = size;
        }
        if let Some(note) = edit.note {
            self.note = note;
        }
        if let Some(priority) = edit.priority {
            self.priority = priority;
        }
        if let Some(links) = edit.links {
            self.links = links;
        }
        self.updated_at = now;
    }
}

/// Owner input for a new item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemDraft {
    pub name: String,
    pub price: Option<Price>,
    pub image: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub note: Option<String>,
    pub priority: Priority,
    pub links: Vec<Link>,
}

impl ItemDraft {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Owner patch of descriptive fields.
///
/// `None` leaves a field alone; `Some(None)` clears an optional field.
/// There is deliberately no way to express a claim change here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemEdit {
    pub name: Option<String>,
    pub price: Option<Option<Price>>,
    pub image: Option<Option<String>>,
    pub color: Option<Option<String>>,
    pub size: Option<Option<String>>,
    pub note: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub links: Option<Vec<Link>>,
}

/// Feed order: priority first, then oldest first, then id.
pub fn feed_order(a: &Item, b: &Item) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
