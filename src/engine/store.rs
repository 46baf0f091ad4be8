use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// Registrations of one event plus the indexes admission checks need.
#[derive(Debug, Clone, Default)]
pub struct RegistrationStore {
    registrations: HashMap<Ulid, Registration>,
    /// Actor → their own active (confirmed or waitlisted) registration.
    active_self: HashMap<ActorId, Ulid>,
    /// Actor → non-cancelled guests they registered.
    guests_by_actor: HashMap<ActorId, usize>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, registration: Registration) -> &Registration {
        let id = registration.id;
        if registration.is_active() {
            match &registration.subject {
                Subject::User { user_id } => {
                    self.active_self.insert(user_id.clone(), id);
                }
                Subject::Guest { .. } => {
                    *self
                        .guests_by_actor
                        .entry(registration.created_by.clone())
                        .or_default() += 1;
                }
            }
        }
        self.registrations.entry(id).or_insert(registration)
    }

    pub fn get(&self, id: Ulid) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.registrations.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Transition a registration. Leaving for CANCELLED drops it from the admission indexes.
    pub fn set_state(&mut self, id: Ulid, state: RegistrationState, at: Ms) -> bool {
        let Some(reg) = self.registrations.get_mut(&id) else {
            return false;
        };
        let was_active = reg.is_active();
        reg.state = state;
        reg.updated_at = at;
        if was_active && state == RegistrationState::Cancelled {
            reg.cancelled_at = Some(at);
            match &reg.subject {
                Subject::User { user_id } => {
                    if self.active_self.get(user_id) == Some(&id) {
                        self.active_self.remove(user_id);
                    }
                }
                Subject::Guest { .. } => {
                    if let Some(n) = self.guests_by_actor.get_mut(&reg.created_by) {
                        *n = n.saturating_sub(1);
                    }
                }
            }
        }
        true
    }

    /// The actor's own active registration, if any. Guests they added don't count.
    pub fn active_self_registration(&self, actor: &ActorId) -> Option<Ulid> {
        self.active_self.get(actor).copied()
    }

    pub fn guest_count_for(&self, actor: &ActorId) -> usize {
        self.guests_by_actor.get(actor).copied().unwrap_or(0)
    }

    pub fn list_by_court(&self, court_id: Ulid) -> Vec<&Registration> {
        let mut out: Vec<&Registration> = self
            .registrations
            .values()
            .filter(|r| r.state.court_id() == Some(court_id))
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    pub fn list_waitlisted(&self) -> Vec<&Registration> {
        let mut out: Vec<&Registration> = self
            .registrations
            .values()
            .filter(|r| r.state == RegistrationState::Waitlisted)
            .collect();
        out.sort_by_key(|r| r.seq);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }
}
