use async_trait::async_trait;
use dashmap::DashSet;
use ulid::Ulid;

use crate::model::ActorId;

/// Role lookup consulted before any privileged command takes an event lock.
///
/// Captains assigned through the engine live in the event's own state and
/// are checked there; the gate answers for roles held outside the tenant.
#[async_trait]
pub trait AuthorizationGate: Send + Sync {
    /// May manage this event's registrations regardless of the event roster.
    async fn can_manage(&self, actor: &ActorId, event_id: Ulid) -> bool;

    /// Admin of every event: may create events and courts.
    async fn is_admin(&self, actor: &ActorId) -> bool;
}

/// In-memory role table of global admins, shared by every tenant.
#[derive(Default)]
pub struct RoleDirectory {
    admins: DashSet<ActorId>,
}

impl RoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_admins(admins: impl IntoIterator<Item = ActorId>) -> Self {
        let dir = Self::new();
        for admin in admins {
            dir.grant_admin(admin);
        }
        dir
    }

    pub fn grant_admin(&self, actor: ActorId) {
        self.admins.insert(actor);
    }
}

#[async_trait]
impl AuthorizationGate for RoleDirectory {
    async fn can_manage(&self, actor: &ActorId, _event_id: Ulid) -> bool {
        self.admins.contains(actor)
    }

    async fn is_admin(&self, actor: &ActorId) -> bool {
        self.admins.contains(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admin_manages_every_event() {
        let dir = RoleDirectory::with_admins([ActorId::from("root")]);
        assert!(dir.can_manage(&ActorId::from("root"), Ulid::new()).await);
        assert!(dir.is_admin(&ActorId::from("root")).await);
    }

    #[tokio::test]
    async fn granted_admin_is_seen_immediately() {
        let dir = RoleDirectory::new();
        let ana = ActorId::from("ana");
        assert!(!dir.is_admin(&ana).await);
        dir.grant_admin(ana.clone());
        assert!(dir.is_admin(&ana).await);
        assert!(dir.can_manage(&ana, Ulid::new()).await);
    }

    #[tokio::test]
    async fn strangers_are_denied() {
        let dir = RoleDirectory::new();
        assert!(!dir.can_manage(&ActorId::from("nobody"), Ulid::new()).await);
        assert!(!dir.is_admin(&ActorId::from("nobody")).await);
    }
}
