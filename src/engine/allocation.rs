use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{PROMOTIONS_TOTAL, REGISTRATIONS_TOTAL};

use super::{Engine, EngineError, EventState, IdReservation, manages, now_ms};

pub(super) fn validate_actor(actor: &ActorId) -> Result<(), EngineError> {
    if actor.as_str().is_empty() {
        return Err(EngineError::Invalid("actor id is empty".into()));
    }
    if actor.as_str().len() > MAX_ACTOR_ID_LEN {
        return Err(EngineError::LimitExceeded("actor id too long"));
    }
    Ok(())
}

fn normalize_guest_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    let len = name.chars().count();
    if !(MIN_GUEST_NAME_LEN..=MAX_GUEST_NAME_LEN).contains(&len) {
        return Err(EngineError::Invalid(format!(
            "guest name must be {MIN_GUEST_NAME_LEN} to {MAX_GUEST_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// The promotion one released seat on `court_id` triggers: the waitlist head
/// takes it, unless the court is closed. Planned against the pre-commit state.
fn plan_release_promotion(state: &EventState, court_id: Ulid, at: Ms) -> Option<Change> {
    if !state.ledger.court(court_id).is_some_and(|c| c.is_open) {
        return None;
    }
    let id = state.waitlist.peek_eligible()?;
    Some(Change::RegistrationPromoted {
        event_id: state.info.id,
        id,
        court_id,
        at,
    })
}

/// Promotions for `seats` opening at once on `court_id`, taken from the head of the waitlist.
/// Planned against the pre-commit state.
pub(super) fn plan_promotions(state: &EventState, court_id: Ulid, seats: u32, at: Ms) -> Vec<Change> {
    state
        .waitlist
        .iter()
        .take(seats as usize)
        .map(|id| Change::RegistrationPromoted {
            event_id: state.info.id,
            id,
            court_id,
            at,
        })
        .collect()
}

pub(super) fn promoted_ids(changes: &[Change]) -> impl Iterator<Item = Ulid> + '_ {
    changes.iter().filter_map(|c| match c {
        Change::RegistrationPromoted { id, .. } => Some(*id),
        _ => None,
    })
}

pub(super) fn record_promotions(changes: &[Change]) {
    let n = promoted_ids(changes).count();
    if n > 0 {
        metrics::counter!(PROMOTIONS_TOTAL).increment(n as u64);
    }
}

impl Engine {
    /// Register the actor themself into `court_id`. Confirmed if a seat is free, waitlisted otherwise.
    pub async fn register(
        &self,
        event_id: Ulid,
        actor: &ActorId,
        court_id: Ulid,
    ) -> Result<Admission, EngineError> {
        self.register_with_id(Ulid::new(), event_id, actor, court_id)
            .await
    }

    pub async fn register_with_id(
        &self,
        id: Ulid,
        event_id: Ulid,
        actor: &ActorId,
        court_id: Ulid,
    ) -> Result<Admission, EngineError> {
        let subject = Subject::User {
            user_id: actor.clone(),
        };
        self.admit(id, event_id, actor, subject, court_id).await
    }

    /// Register a named guest on the actor's behalf. Counts against the actor's guest quota.
    pub async fn register_guest(
        &self,
        event_id: Ulid,
        actor: &ActorId,
        guest_name: &str,
        court_id: Ulid,
    ) -> Result<Admission, EngineError> {
        self.register_guest_with_id(Ulid::new(), event_id, actor, guest_name, court_id)
            .await
    }

    pub async fn register_guest_with_id(
        &self,
        id: Ulid,
        event_id: Ulid,
        actor: &ActorId,
        guest_name: &str,
        court_id: Ulid,
    ) -> Result<Admission, EngineError> {
        let name = normalize_guest_name(guest_name)?;
        self.admit(id, event_id, actor, Subject::Guest { name }, court_id)
            .await
    }

    async fn admit(
        &self,
        id: Ulid,
        event_id: Ulid,
        actor: &ActorId,
        subject: Subject,
        court_id: Ulid,
    ) -> Result<Admission, EngineError> {
        validate_actor(actor)?;
        let reservation = IdReservation::claim(&self.registration_to_event, id, event_id)?;

        let mut guard = self.lock_event(event_id).await?;
        if guard.info.status != EventStatus::Open {
            return Err(EngineError::EventClosed(event_id));
        }
        let court = guard
            .ledger
            .court(court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        if !court.is_open {
            return Err(EngineError::CourtClosed(court_id));
        }
        if guard.store.len() >= MAX_REGISTRATIONS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many registrations in event"));
        }
        match &subject {
            Subject::User { .. } => {
                if let Some(existing) = guard.store.active_self_registration(actor) {
                    return Err(EngineError::AlreadyRegistered(existing));
                }
            }
            Subject::Guest { .. } => {
                if guard.store.guest_count_for(actor) >= MAX_GUESTS_PER_ACTOR {
                    return Err(EngineError::GuestQuotaExceeded(MAX_GUESTS_PER_ACTOR));
                }
            }
        }

        let seated = guard.ledger.available(court_id) > 0;
        let state = if seated {
            RegistrationState::Confirmed { court_id }
        } else {
            RegistrationState::Waitlisted
        };
        let kind = subject.kind();
        let change = Change::RegistrationCreated {
            event_id,
            id,
            subject,
            created_by: actor.clone(),
            seq: guard.next_seq(),
            at: now_ms(),
            court_id: seated.then_some(court_id),
        };
        let changes = self.commit(&mut guard, vec![change]).await?;
        reservation.commit();
        drop(guard);
        self.notify.publish(&changes);

        metrics::counter!(REGISTRATIONS_TOTAL, "kind" => kind, "state" => state.as_str())
            .increment(1);
        tracing::debug!("{kind} registration {id} in event {event_id}: {}", state.as_str());
        Ok(Admission {
            registration_id: id,
            state,
        })
    }

    /// Move a confirmed registration to another court of the same event.
    /// Every destination check runs before the source seat is released; the
    /// freed source seat then goes to the head of the waitlist.
    pub async fn move_registration(
        &self,
        registration_id: Ulid,
        to_court_id: Ulid,
        actor: &ActorId,
    ) -> Result<Relocation, EngineError> {
        let event_id = self
            .event_for_registration(&registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let gate_allows = self.gate.can_manage(actor, event_id).await;

        let mut guard = self.lock_event(event_id).await?;
        let is_manager = manages(gate_allows, &guard, actor);
        let reg = guard
            .store
            .get(registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let is_owner = reg.owner() == actor;
        let current = reg.state;
        if !(is_manager || (is_owner && self.policy.owner_self_service)) {
            return Err(EngineError::NotAuthorized);
        }
        if guard.info.status == EventStatus::Finalized {
            return Err(EngineError::EventClosed(event_id));
        }
        let RegistrationState::Confirmed { court_id: from } = current else {
            return Err(EngineError::InvalidTransition(
                "only confirmed registrations can move",
            ));
        };
        if from == to_court_id {
            return Err(EngineError::InvalidTransition(
                "registration is already on that court",
            ));
        }
        let dest = guard
            .ledger
            .court(to_court_id)
            .ok_or(EngineError::NotFound(to_court_id))?;
        if !dest.is_open {
            return Err(EngineError::CourtClosed(to_court_id));
        }
        if dest.free() == 0 {
            return Err(EngineError::DestinationFull(to_court_id));
        }

        let at = now_ms();
        let mut changes = vec![Change::RegistrationMoved {
            event_id,
            id: registration_id,
            from_court_id: from,
            to_court_id,
            at,
        }];
        changes.extend(plan_release_promotion(&guard, from, at));
        let changes = self.commit(&mut guard, changes).await?;
        drop(guard);
        self.notify.publish(&changes);
        record_promotions(&changes);

        let promoted = promoted_ids(&changes).next();
        tracing::debug!(
            "moved {registration_id} from {from} to {to_court_id}, promoted {promoted:?}"
        );
        Ok(Relocation {
            registration_id,
            from_court_id: from,
            state: RegistrationState::Confirmed {
                court_id: to_court_id,
            },
            promoted,
        })
    }

    /// Cancel a registration. Cancelling twice is a no-op; a freed seat goes to the waitlist head.
    pub async fn cancel(
        &self,
        registration_id: Ulid,
        actor: &ActorId,
    ) -> Result<Cancellation, EngineError> {
        let event_id = self
            .event_for_registration(&registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let gate_allows = self.gate.can_manage(actor, event_id).await;

        let mut guard = self.lock_event(event_id).await?;
        let is_manager = manages(gate_allows, &guard, actor);
        let reg = guard
            .store
            .get(registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let is_owner = reg.owner() == actor;
        let current = reg.state;
        let owner_may = match current {
            RegistrationState::Confirmed { .. } => self.policy.owner_self_service,
            RegistrationState::Waitlisted | RegistrationState::Cancelled => true,
        };
        if !(is_manager || (is_owner && owner_may)) {
            return Err(EngineError::NotAuthorized);
        }
        if current == RegistrationState::Cancelled {
            return Ok(Cancellation {
                registration_id,
                state: current,
                promoted: None,
            });
        }
        if guard.info.status == EventStatus::Finalized {
            return Err(EngineError::EventClosed(event_id));
        }

        let at = now_ms();
        let mut changes = vec![Change::RegistrationCancelled {
            event_id,
            id: registration_id,
            at,
        }];
        if let RegistrationState::Confirmed { court_id } = current {
            changes.extend(plan_release_promotion(&guard, court_id, at));
        }
        let changes = self.commit(&mut guard, changes).await?;
        drop(guard);
        self.notify.publish(&changes);
        record_promotions(&changes);

        let promoted = promoted_ids(&changes).next();
        tracing::debug!("cancelled {registration_id} ({}), promoted {promoted:?}", current.as_str());
        Ok(Cancellation {
            registration_id,
            state: RegistrationState::Cancelled,
            promoted,
        })
    }
}
