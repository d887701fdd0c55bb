//! Trip invitations between users.
//!
//! Every user owns an `invitations` syncgroup over the `invitations`
//! prefix. Inviting someone joins their group and writes
//! `invitations.<owner>.<recipient> = <sender>`, where `owner` is the user
//! whose trip is shared. Declining or accepting deletes the entry. Owner and
//! recipient segments are escaped.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::key::{escape_key_element, key, unescape_key_element, Key, VALUE_KEY};
use crate::marshalling::{marshal, read_value};
use crate::store::Store;
use crate::syncgroup::{SyncgroupHandle, SyncgroupKey, SyncgroupRegistry};
use crate::transport::{failed_write, Syncbase, WriteFuture};

pub const INVITATIONS: &str = "invitations";

/// Key of the invitation of `recipient` to the trip of `owner`.
pub fn invitation_key(owner: &str, recipient: &str) -> Key {
    vec![
        INVITATIONS.to_string(),
        escape_key_element(owner),
        escape_key_element(recipient),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Invitation {
    /// User whose trip the invitation is for.
    pub owner: String,
    pub recipient: String,
    /// User who sent the invitation.
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationEvent {
    Invited(Invitation),
    /// The invitation was accepted, declined or withdrawn.
    Dismissed(Invitation),
}

#[derive(Debug, Default)]
pub struct InvitationUpdate {
    pub events: Vec<InvitationEvent>,
    pub errors: Vec<SyncError>,
}

pub struct InvitationSync {
    syncbase: Arc<dyn Syncbase>,
    registry: SyncgroupRegistry,
    store: Store,
    username: String,
    active_invite: Option<String>,
    /// (owner, recipient) to sender, as of the last processed snapshot.
    invitations: BTreeMap<(String, String), String>,
}

impl InvitationSync {
    pub fn new(
        syncbase: Arc<dyn Syncbase>,
        registry: &SyncgroupRegistry,
        store: &Store,
        username: impl Into<String>,
    ) -> Self {
        Self {
            syncbase,
            registry: registry.clone(),
            store: store.clone(),
            username: username.into(),
            active_invite: None,
            invitations: BTreeMap::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Owner of the trip this user joined through an invitation.
    pub fn active_invite(&self) -> Option<&str> {
        self.active_invite.as_deref()
    }

    fn group(&self, admin: &str) -> SyncgroupHandle {
        SyncgroupHandle::new(
            &self.registry,
            &self.store,
            SyncgroupKey::new(admin, INVITATIONS),
        )
    }

    /// Creates this user's invitation syncgroup, or joins it if another
    /// device of the user already did.
    pub async fn create_group(&self) -> Result<bool, SyncError> {
        let group = self.group(&self.username);
        group
            .create_or_join(group.build_spec(vec![key(&[INVITATIONS])]))
            .await
    }

    /// Invites `recipient` to the active trip.
    ///
    /// Fails with [`SyncError::NotFound`] if the recipient never created an
    /// invitation syncgroup.
    pub async fn invite(&self, recipient: &str) -> Result<(), SyncError> {
        self.group(recipient).join().await?;
        let owner = self.active_invite.as_deref().unwrap_or(&self.username);
        info!("Inviting {} to the trip of {}", recipient, owner);
        let sender = marshal(&self.username)?;
        self.syncbase
            .put(invitation_key(owner, recipient), sender)
            .await
    }

    /// Declines the invitation to the trip of `owner`.
    pub fn decline(&self, owner: &str) -> WriteFuture {
        debug!("Declining invitation from {}", owner);
        self.syncbase.delete(invitation_key(owner, &self.username))
    }

    /// Accepts the invitation to the trip of `owner` and removes it.
    ///
    /// Later invitations sent by this user are for that owner's trip.
    pub fn accept(&mut self, owner: &str) -> WriteFuture {
        if owner.is_empty() {
            return failed_write(SyncError::InvalidKey(String::new()));
        }
        info!("Accepting invitation from {}", owner);
        self.active_invite = Some(owner.to_string());
        self.syncbase.delete(invitation_key(owner, &self.username))
    }

    /// Invitations addressed to this user.
    pub fn received(&self) -> Vec<Invitation> {
        self.invitations
            .iter()
            .filter(|((_, recipient), _)| *recipient == self.username)
            .map(|((owner, recipient), sender)| Invitation {
                owner: owner.clone(),
                recipient: recipient.clone(),
                sender: sender.clone(),
            })
            .collect()
    }

    /// Diffs the `invitations` subtree against the last one seen.
    pub fn process_invitations(&mut self, data: Option<&Value>) -> InvitationUpdate {
        let mut update = InvitationUpdate::default();
        let mut current = BTreeMap::new();

        let owners = data.and_then(Value::as_object).into_iter().flatten();
        for (owner, record) in owners.filter(|(owner, _)| owner.as_str() != VALUE_KEY) {
            let owner = unescape_key_element(owner);
            let Some(record) = record.as_object() else {
                warn!("Ignoring malformed invitations of {}", owner);
                update.errors.push(SyncError::Corruption(format!(
                    "invitations of {}: {}",
                    owner, record
                )));
                continue;
            };
            for (recipient, sender) in record.iter().filter(|(r, _)| r.as_str() != VALUE_KEY) {
                let recipient = unescape_key_element(recipient);
                match read_value::<String>(Some(sender)) {
                    Ok(Some(sender)) => {
                        current.insert((owner.clone(), recipient), sender);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Unreadable invitation {} -> {}: {}", owner, recipient, e);
                        update.errors.push(e.into());
                    }
                }
            }
        }

        for ((owner, recipient), sender) in &current {
            if !self.invitations.contains_key(&(owner.clone(), recipient.clone())) {
                update.events.push(InvitationEvent::Invited(Invitation {
                    owner: owner.clone(),
                    recipient: recipient.clone(),
                    sender: sender.clone(),
                }));
            }
        }
        for ((owner, recipient), sender) in &self.invitations {
            if !current.contains_key(&(owner.clone(), recipient.clone())) {
                update.events.push(InvitationEvent::Dismissed(Invitation {
                    owner: owner.clone(),
                    recipient: recipient.clone(),
                    sender: sender.clone(),
                }));
            }
        }

        self.invitations = current;
        update
    }
}

impl std::fmt::Debug for InvitationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitationSync")
            .field("username", &self.username)
            .field("active_invite", &self.active_invite)
            .field("invitations", &self.invitations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::TieBreak;
    use crate::sync_loop::SyncLoop;

    struct User {
        store: Store,
        invitations: InvitationSync,
    }

    async fn user(registry: &SyncgroupRegistry, name: &str) -> User {
        let store = Store::new();
        let invitations = InvitationSync::new(Arc::new(store.clone()), registry, &store, name);
        invitations.create_group().await.unwrap();
        User { store, invitations }
    }

    impl User {
        fn process(&mut self) -> InvitationUpdate {
            let data = self.store.get_data_at(&key(&[INVITATIONS])).unwrap();
            self.invitations.process_invitations(data.as_ref())
        }
    }

    fn invitation(owner: &str, recipient: &str, sender: &str) -> Invitation {
        Invitation {
            owner: owner.to_string(),
            recipient: recipient.to_string(),
            sender: sender.to_string(),
        }
    }

    #[test]
    fn test_invitation_key_is_escaped() {
        assert_eq!(
            invitation_key("alice@example.com", "bob_b"),
            key(&["invitations", "alice_aexample_dcom", "bob__b"])
        );
    }

    #[tokio::test]
    async fn test_invite_reaches_recipient() {
        let registry = SyncgroupRegistry::new();
        let mut alice = user(&registry, "alice@example.com").await;
        let mut bob = user(&registry, "bob.b").await;
        let sync = SyncLoop::new(registry.clone(), TieBreak::FirstObserved);

        alice.invitations.invite("bob.b").await.unwrap();
        sync.tick();

        let expected = invitation("alice@example.com", "bob.b", "alice@example.com");
        let update = bob.process();
        assert!(update.errors.is_empty());
        assert_eq!(update.events, vec![InvitationEvent::Invited(expected.clone())]);
        assert_eq!(bob.invitations.received(), vec![expected.clone()]);

        // Already known invitations are not announced again.
        assert!(bob.process().events.is_empty());
        assert_eq!(
            alice.process().events,
            vec![InvitationEvent::Invited(expected)]
        );
        assert!(alice.invitations.received().is_empty());
    }

    #[tokio::test]
    async fn test_decline_dismisses_on_both_sides() {
        let registry = SyncgroupRegistry::new();
        let mut alice = user(&registry, "alice").await;
        let mut bob = user(&registry, "bob").await;
        let sync = SyncLoop::new(registry.clone(), TieBreak::FirstObserved);

        alice.invitations.invite("bob").await.unwrap();
        sync.tick();
        alice.process();
        bob.process();

        bob.invitations.decline("alice").await.unwrap();
        sync.tick();

        let dismissed = vec![InvitationEvent::Dismissed(invitation("alice", "bob", "alice"))];
        assert_eq!(bob.process().events, dismissed);
        assert_eq!(alice.process().events, dismissed);
        assert!(bob.invitations.received().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_invite_is_forwarded_for_owner() {
        let registry = SyncgroupRegistry::new();
        let mut alice = user(&registry, "alice").await;
        let mut bob = user(&registry, "bob").await;
        let carol = user(&registry, "carol").await;
        let sync = SyncLoop::new(registry.clone(), TieBreak::FirstObserved);

        alice.invitations.invite("bob").await.unwrap();
        sync.tick();
        bob.process();
        bob.invitations.accept("alice").await.unwrap();
        assert_eq!(bob.invitations.active_invite(), Some("alice"));

        bob.invitations.invite("carol").await.unwrap();
        for _ in 0..3 {
            sync.tick();
        }
        assert_eq!(
            carol.store.get(&invitation_key("alice", "carol")).unwrap().as_deref(),
            Some("\"bob\"")
        );
        // The accepted invitation is gone before alice ever processed it.
        assert_eq!(
            alice.process().events,
            vec![InvitationEvent::Invited(invitation("alice", "carol", "bob"))]
        );
    }

    #[tokio::test]
    async fn test_invite_without_recipient_group_fails() {
        let registry = SyncgroupRegistry::new();
        let alice = user(&registry, "alice").await;

        assert_eq!(
            alice.invitations.invite("nobody").await,
            Err(SyncError::not_found("nobody", INVITATIONS))
        );
        assert_eq!(alice.store.get(&invitation_key("alice", "nobody")).unwrap(), None);
    }

    #[test]
    fn test_corrupt_invitation_reported() {
        let store = Store::new();
        store.put(&invitation_key("alice", "bob"), "not json").unwrap();
        let mut invitations =
            InvitationSync::new(Arc::new(store.clone()), &SyncgroupRegistry::new(), &store, "bob");

        let data = store.get_data_at(&key(&[INVITATIONS])).unwrap();
        let update = invitations.process_invitations(data.as_ref());

        assert!(update.events.is_empty());
        assert!(update.errors[0].is_corruption());
    }
}
