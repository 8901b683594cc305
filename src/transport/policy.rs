//! Role-compatibility rules deciding which peers may be linked

use crate::core::{PeerDescriptor, PeerId, Role};
use std::fmt;

/// Who this device is and which anchor, if any, the user picked
#[derive(Debug, Clone, PartialEq)]
pub struct LocalIdentity {
    pub descriptor: PeerDescriptor,
    /// Navigator only: the anchor chosen before connecting
    pub selected_anchor: Option<PeerId>,
}

impl LocalIdentity {
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            selected_anchor: None,
        }
    }

    pub fn with_selected_anchor(mut self, anchor: PeerId) -> Self {
        self.selected_anchor = Some(anchor);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.descriptor.peer_id()
    }

    pub fn role(&self) -> Role {
        self.descriptor.role
    }
}

/// Why a link was refused
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Role combination is never linked
    RoleMismatch { local: Role, remote: Role },
    /// Navigator has picked a different anchor
    NotSelectedAnchor { selected: PeerId },
    /// Remote advertises our own identity
    SelfLink,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::RoleMismatch { local, remote } => {
                write!(f, "{} does not link with {}", local, remote)
            }
            RejectReason::NotSelectedAnchor { selected } => {
                write!(f, "only the selected anchor {} is allowed", selected)
            }
            RejectReason::SelfLink => write!(f, "remote peer is this device"),
        }
    }
}

/// Outcome of the acceptance policy
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Accept,
    Reject(RejectReason),
}

impl PolicyDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, PolicyDecision::Accept)
    }
}

/// Decide whether a link between `local` and `remote` is allowed.
///
/// A navigator links only anchors, and only the selected one when a selection
/// exists. An anchor links any navigator and any other anchor.
pub fn evaluate(local: &LocalIdentity, remote: &PeerDescriptor) -> PolicyDecision {
    if remote.peer_id() == local.peer_id() {
        return PolicyDecision::Reject(RejectReason::SelfLink);
    }

    match (local.role(), remote.role) {
        (Role::Navigator, Role::Anchor) => match &local.selected_anchor {
            Some(selected) if *selected != remote.peer_id() => {
                PolicyDecision::Reject(RejectReason::NotSelectedAnchor {
                    selected: selected.clone(),
                })
            }
            _ => PolicyDecision::Accept,
        },
        (Role::Anchor, Role::Navigator) | (Role::Anchor, Role::Anchor) => PolicyDecision::Accept,
        (local_role, remote_role) => PolicyDecision::Reject(RejectReason::RoleMismatch {
            local: local_role,
            remote: remote_role,
        }),
    }
}

/// Whether this side sends the invitation once the policy accepts.
///
/// Navigators always invite anchors. Between two anchors the smaller peer id
/// invites so that only one link is opened.
pub fn should_invite(local: &LocalIdentity, remote: &PeerDescriptor) -> bool {
    if !evaluate(local, remote).is_accept() {
        return false;
    }
    match (local.role(), remote.role) {
        (Role::Navigator, Role::Anchor) => true,
        (Role::Anchor, Role::Anchor) => local.peer_id() < remote.peer_id(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(Role::Anchor, id, format!("Anchor {}", id))
    }

    fn navigator(id: &str) -> PeerDescriptor {
        PeerDescriptor::new(Role::Navigator, id, format!("Navigator {}", id))
    }

    #[test]
    fn test_navigator_accepts_any_anchor_without_selection() {
        let local = LocalIdentity::new(navigator("n1"));
        assert!(evaluate(&local, &anchor("a1")).is_accept());
        assert!(evaluate(&local, &anchor("a2")).is_accept());
    }

    #[test]
    fn test_navigator_accepts_only_selected_anchor() {
        let local = LocalIdentity::new(navigator("n1")).with_selected_anchor(anchor("a2").peer_id());
        assert!(!evaluate(&local, &anchor("a1")).is_accept());
        assert!(evaluate(&local, &anchor("a2")).is_accept());
        assert!(!should_invite(&local, &anchor("a1")));
        assert!(should_invite(&local, &anchor("a2")));
    }

    #[test]
    fn test_navigator_rejects_navigator() {
        let local = LocalIdentity::new(navigator("n1"));
        assert_eq!(
            evaluate(&local, &navigator("n2")),
            PolicyDecision::Reject(RejectReason::RoleMismatch {
                local: Role::Navigator,
                remote: Role::Navigator,
            })
        );
    }

    #[test]
    fn test_anchor_accepts_everyone() {
        let local = LocalIdentity::new(anchor("a1"));
        assert!(evaluate(&local, &navigator("n1")).is_accept());
        assert!(evaluate(&local, &anchor("a2")).is_accept());
        assert!(!evaluate(&local, &anchor("a1")).is_accept());
    }

    #[test]
    fn test_only_one_anchor_invites() {
        let a1 = LocalIdentity::new(anchor("a1"));
        let a2 = LocalIdentity::new(anchor("a2"));
        assert!(should_invite(&a1, &anchor("a2")));
        assert!(!should_invite(&a2, &anchor("a1")));
        // navigators dial anchors, never the other way round
        assert!(!should_invite(&a1, &navigator("n1")));
    }
}
