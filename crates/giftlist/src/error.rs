//! Error types.
//!
//! Claim failures are typed so callers can decide whether to surface them,
//! refresh, or silently disable an affordance. None of the user-facing text
//! derived from these errors contains store internals: another claimant's
//! state must not leak through an error banner.

use thiserror::Error;

use crate::claim::Rejection;
use crate::item::ItemRef;

/// Errors raised by [`ClaimEngine::apply`](crate::ClaimEngine::apply).
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The transition table does not allow this action from the item's
    /// current state (or the actor owns the list).
    #[error("invalid transition: {0}")]
    InvalidTransition(Rejection),

    /// The item disappeared, most likely deleted by its owner.
    #[error("item {0} not found")]
    ItemNotFound(ItemRef),

    /// The caller has no uid or no display name yet.
    #[error("identity is not ready to claim")]
    IdentityNotReady,

    /// Transport or infrastructure failure, including contention that
    /// outlasted the retry budget.
    #[error("store unavailable")]
    StoreUnavailable(#[source] StoreError),
}

impl ClaimError {
    /// The rejection reason, when this is an invalid transition.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            ClaimError::InvalidTransition(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Coarse, user-safe classification of a failure.
///
/// UI layers should render [`SafeErrorCategory::user_message`] and nothing
/// else; the category carries no details about other claimants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafeErrorCategory {
    /// The action is no longer available.
    Rejected,
    /// The UI is showing something that no longer exists.
    Stale,
    /// The affordance should have been disabled.
    NotReady,
    /// Try again later.
    Unavailable,
}

impl SafeErrorCategory {
    pub fn user_message(&self) -> &'static str {
        match self {
            SafeErrorCategory::Rejected => "That action is no longer available.",
            SafeErrorCategory::Stale => "This item was removed. The list has been refreshed.",
            SafeErrorCategory::NotReady => "Choose a name before reserving items.",
            SafeErrorCategory::Unavailable => "Something went wrong. Please try again.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SafeErrorCategory::Unavailable)
    }
}

/// Errors that can be classified into a [`SafeErrorCategory`].
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

impl Categorizable for ClaimError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            ClaimError::InvalidTransition(_) => SafeErrorCategory::Rejected,
            ClaimError::ItemNotFound(_) => SafeErrorCategory::Stale,
            ClaimError::IdentityNotReady => SafeErrorCategory::NotReady,
            ClaimError::StoreUnavailable(_) => SafeErrorCategory::Unavailable,
        }
    }
}

/// Errors reported by a [`DocumentStore`](crate::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item {0} not found")]
    ItemNotFound(ItemRef),

    #[error("list {0} not found")]
    ListNotFound(uuid::Uuid),

    #[error("slug '{0}' is already taken")]
    SlugTaken(String),

    #[error(transparent)]
    InvalidList(#[from] ListError),

    /// Optimistic commit kept losing to concurrent writers.
    #[error("gave up after {attempts} conflicting attempts")]
    Contention { attempts: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ItemNotFound(item) => ClaimError::ItemNotFound(item),
            other => ClaimError::StoreUnavailable(other),
        }
    }
}

/// Validation failures for item documents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("price '{0}' is not a non-negative amount with at most two decimals")]
    InvalidPrice(String),

    #[error("unknown priority '{0}'")]
    UnknownPriority(String),

    #[error("claim record violates invariants: {0}")]
    InconsistentClaim(&'static str),
}

/// Validation failures for list documents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListError {
    #[error("list slug is required")]
    EmptySlug,

    #[error("slug '{0}' may only contain letters, digits, '-' and '_'")]
    InvalidSlug(String),
}

/// Failures from the identity provider or preference store.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity provider error: {0}")]
    Provider(String),

    #[error("preference store error: {0}")]
    Preferences(String),
}
