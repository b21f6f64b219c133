//! What each viewer may see and do.
//!
//! [`visible_actions`] reads the same [`TRANSITIONS`](crate::claim::TRANSITIONS)
//! table the engine enforces, so an offered action is exactly an action the
//! engine would accept against the same snapshot.

use smallvec::SmallVec;

use crate::claim::{rule, ClaimAction, Position, Rule};
use crate::identity::{Actor, Viewer};
use crate::item::{ClaimState, Item, ItemStatus};
use crate::list::List;

pub type ActionSet = SmallVec<[ClaimAction; 4]>;

/// Claim actions to offer `actor` on `item`.
///
/// Owners get none on the public view, and neither does anyone without a
/// ready identity.
pub fn visible_actions(item: &Item, actor: Option<&Actor>, is_owner: bool) -> ActionSet {
    let Some(actor) = actor.filter(|actor| actor.is_ready()) else {
        return ActionSet::new();
    };
    if is_owner {
        return ActionSet::new();
    }
    let position = Position::of(&item.claim, &actor.uid);
    ClaimAction::ALL
        .into_iter()
        .filter(|action| rule(position, *action) == Rule::Allow)
        .collect()
}

/// An item as one viewer should see it.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub item: Item,
    /// Claimant name to show, if the list shows names and there is one.
    pub claimed_by: Option<String>,
    pub actions: ActionSet,
}

impl ItemView {
    pub fn status(&self) -> ItemStatus {
        self.item.status()
    }
}

/// Project an item for a viewer.
///
/// Owners of anti-spoiler lists see every item as available with no
/// claimant. Visitors see claim state, and claimant names only when the list
/// shows them.
pub fn project(item: &Item, list: &List, viewer: &Viewer) -> ItemView {
    match viewer {
        Viewer::Owner(_) => {
            let mut item = item.clone();
            if list.anti_spoiler {
                item.claim = ClaimState::Available;
            }
            let claimed_by = claimant_name(&item);
            ItemView {
                item,
                claimed_by,
                actions: ActionSet::new(),
            }
        }
        Viewer::Visitor(me) => {
            let actor = me.actor().ok();
            ItemView {
                item: item.clone(),
                claimed_by: claimant_name(item).filter(|_| list.show_claimer_names),
                actions: visible_actions(item, actor.as_ref(), false),
            }
        }
    }
}

fn claimant_name(item: &Item) -> Option<String> {
    match &item.claim {
        ClaimState::Available => None,
        ClaimState::Reserved { reservation } => Some(reservation.name.clone()),
        ClaimState::Purchased { purchase, .. } => Some(purchase.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::decide;
    use crate::identity::{Me, Uid};
    use crate::item::ItemDraft;
    use chrono::Utc;
    use uuid::Uuid;
    use crate::claim::ClaimAction::*;

    fn item() -> Item {
        Item::from_draft(Uuid::new_v4(), ItemDraft::named("Lamp"), Utc::now())
    }

    fn after(item: &Item, steps: &[(ClaimAction, &Actor)]) -> Item {
        let mut item = item.clone();
        for (action, actor) in steps {
            item.claim = decide(&item.claim, *action, actor, Utc::now()).unwrap();
        }
        item
    }

    fn actions(item: &Item, actor: &Actor) -> Vec<ClaimAction> {
        visible_actions(item, Some(actor), false).into_vec()
    }

    #[test]
    fn test_actions_follow_position() {
        let alice = Actor::new("u1", "Alice");
        let bob = Actor::new("u2", "Bob");
        let fresh = item();
        assert_eq!(actions(&fresh, &alice), vec![Reserve, Purchase]);

        let reserved = after(&fresh, &[(Reserve, &alice)]);
        assert_eq!(actions(&reserved, &alice), vec![Unreserve, Purchase]);
        assert!(actions(&reserved, &bob).is_empty());

        let purchased = after(&reserved, &[(Purchase, &alice)]);
        assert_eq!(actions(&purchased, &alice), vec![Unpurchase]);
        assert!(actions(&purchased, &bob).is_empty());
    }

    #[test]
    fn test_every_offered_action_is_accepted() {
        let alice = Actor::new("u1", "Alice");
        let bob = Actor::new("u2", "Bob");
        let states = [
            item(),
            after(&item(), &[(Reserve, &alice)]),
            after(&item(), &[(Purchase, &alice)]),
            after(&item(), &[(Reserve, &alice), (Purchase, &alice)]),
        ];
        for state in &states {
            for actor in [&alice, &bob] {
                let offered = visible_actions(state, Some(actor), false);
                for action in ClaimAction::ALL {
                    let accepted = decide(&state.claim, action, actor, Utc::now()).is_ok();
                    assert_eq!(offered.contains(&action), accepted, "{action} on {:?}", state.claim);
                }
            }
        }
    }

    #[test]
    fn test_no_actions_for_owner_or_unready() {
        let fresh = item();
        let owner = Actor::new("owner", "Olivia");
        assert!(visible_actions(&fresh, Some(&owner), true).is_empty());
        assert!(visible_actions(&fresh, None, false).is_empty());
        assert!(visible_actions(&fresh, Some(&Actor::new("u1", " ")), false).is_empty());
    }

    #[test]
    fn test_anti_spoiler_hides_claims_from_owner() {
        let alice = Actor::new("u1", "Alice");
        let reserved = after(&item(), &[(Reserve, &alice)]);
        let mut list = List::new(Uid::new("owner"), "Wedding", "wedding".into(), Utc::now());

        let view = project(&reserved, &list, &Viewer::Owner(Uid::new("owner")));
        assert_eq!(view.status(), ItemStatus::Available);
        assert!(view.claimed_by.is_none());

        list.anti_spoiler = false;
        let view = project(&reserved, &list, &Viewer::Owner(Uid::new("owner")));
        assert_eq!(view.status(), ItemStatus::Reserved);
        assert_eq!(view.claimed_by.as_deref(), Some("Alice"));
        assert!(view.actions.is_empty());
    }

    #[test]
    fn test_visitor_projection_respects_name_setting() {
        let alice = Actor::new("u1", "Alice");
        let reserved = after(&item(), &[(Reserve, &alice)]);
        let mut list = List::new(Uid::new("owner"), "Wedding", "wedding".into(), Utc::now());
        let me = Me {
            uid: Some(Uid::new("u1")),
            name: Some("Alice".into()),
            is_anonymous: true,
            resolved: true,
        };

        let view = project(&reserved, &list, &Viewer::Visitor(me.clone()));
        assert_eq!(view.claimed_by.as_deref(), Some("Alice"));
        assert_eq!(view.actions.into_vec(), vec![Unreserve, Purchase]);

        list.show_claimer_names = false;
        let view = project(&reserved, &list, &Viewer::Visitor(me));
        assert!(view.claimed_by.is_none());
        assert_eq!(view.status(), ItemStatus::Reserved);
    }
}
