//! The claim transition table.
//!
//! Every claim rule lives in [`TRANSITIONS`]. The engine uses it through
//! [`decide`] and the visibility policy uses it through [`rule`], so the
//! buttons a visitor sees and the transitions the engine accepts cannot
//! drift apart.
//!
//! ```text
//!                  reserve      unreserve    purchase     unpurchase
//! available        Allow        NotYourRes   Allow        NotYourPur
//! reserved (me)    Taken        Allow        Allow        NotYourPur
//! reserved (other) Taken        NotYourRes   ReservedElse NotYourPur
//! purchased (me)   Taken        NotYourRes   Purchased    Allow
//! purchased (other)Taken        NotYourRes   Purchased    NotYourPur
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{Actor, Uid};
use crate::item::{Claim, ClaimState};

/// A claim action a visitor can take on an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimAction {
    Reserve = 0,
    Unreserve = 1,
    Purchase = 2,
    Unpurchase = 3,
}

impl ClaimAction {
    pub const ALL: [ClaimAction; 4] = [
        ClaimAction::Reserve,
        ClaimAction::Unreserve,
        ClaimAction::Purchase,
        ClaimAction::Unpurchase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimAction::Reserve => "reserve",
            ClaimAction::Unreserve => "unreserve",
            ClaimAction::Purchase => "purchase",
            ClaimAction::Unpurchase => "unpurchase",
        }
    }
}

impl fmt::Display for ClaimAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClaimAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown claim action '{0}'")]
pub struct UnknownAction(pub String);

/// Why a claim action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    AlreadyTaken,
    NotYourReservation,
    ReservedBySomeoneElse,
    AlreadyPurchased,
    NotYourPurchase,
    OwnerCannotClaim,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rejection::AlreadyTaken => "already taken",
            Rejection::NotYourReservation => "not your reservation",
            Rejection::ReservedBySomeoneElse => "reserved by someone else",
            Rejection::AlreadyPurchased => "already purchased",
            Rejection::NotYourPurchase => "not your purchase",
            Rejection::OwnerCannotClaim => "list owners cannot claim their own items",
        })
    }
}

/// Where an item's claim state stands relative to one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Available = 0,
    ReservedByActor = 1,
    ReservedByOther = 2,
    PurchasedByActor = 3,
    PurchasedByOther = 4,
}

impl Position {
    pub fn of(state: &ClaimState, uid: &Uid) -> Self {
        match state {
            ClaimState::Available => Position::Available,
            ClaimState::Reserved { reservation } if reservation.uid == *uid => {
                Position::ReservedByActor
            }
            ClaimState::Reserved { .. } => Position::ReservedByOther,
            ClaimState::Purchased { purchase, .. } if purchase.uid == *uid => {
                Position::PurchasedByActor
            }
            ClaimState::Purchased { .. } => Position::PurchasedByOther,
        }
    }
}

/// One cell of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Allow,
    Reject(Rejection),
}

use ClaimAction as A;
use Rejection::*;
use Rule::{Allow, Reject};

/// Rows are indexed by [`Position`], columns by [`ClaimAction`].
pub const TRANSITIONS: [(Position, [Rule; 4]); 5] = [
    (
        Position::Available,
        [Allow, Reject(NotYourReservation), Allow, Reject(NotYourPurchase)],
    ),
    (
        Position::ReservedByActor,
        [Reject(AlreadyTaken), Allow, Allow, Reject(NotYourPurchase)],
    ),
    (
        Position::ReservedByOther,
        [
            Reject(AlreadyTaken),
            Reject(NotYourReservation),
            Reject(ReservedBySomeoneElse),
            Reject(NotYourPurchase),
        ],
    ),
    (
        Position::PurchasedByActor,
        [
            Reject(AlreadyTaken),
            Reject(NotYourReservation),
            Reject(AlreadyPurchased),
            Allow,
        ],
    ),
    (
        Position::PurchasedByOther,
        [
            Reject(AlreadyTaken),
            Reject(NotYourReservation),
            Reject(AlreadyPurchased),
            Reject(NotYourPurchase),
        ],
    ),
];

pub fn rule(position: Position, action: ClaimAction) -> Rule {
    TRANSITIONS[position as usize].1[action as usize]
}

/// Decide the claim state that `action` by `actor` produces.
///
/// Pure: no IO, no clock. The store re-runs it against a fresh snapshot
/// whenever an optimistic commit conflicts.
pub fn decide(
    state: &ClaimState,
    action: ClaimAction,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<ClaimState, Rejection> {
    if let Reject(reason) = rule(Position::of(state, &actor.uid), action) {
        return Err(reason);
    }

    let claim = Claim::new(actor, now);
    let next = match (action, state) {
        (A::Reserve, _) => ClaimState::Reserved { reservation: claim },
        (A::Unreserve, _) => ClaimState::Available,
        (A::Purchase, ClaimState::Reserved { reservation }) => ClaimState::Purchased {
            purchase: claim,
            reservation: Some(reservation.clone()),
        },
        (A::Purchase, _) => ClaimState::Purchased {
            purchase: claim,
            reservation: None,
        },
        (
            A::Unpurchase,
            ClaimState::Purchased {
                reservation: Some(reservation),
                ..
            },
        ) if reservation.uid == actor.uid => ClaimState::Reserved {
            reservation: reservation.clone(),
        },
        (A::Unpurchase, _) => ClaimState::Available,
    };
    Ok(next)
}
