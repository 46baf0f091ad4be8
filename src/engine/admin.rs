use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::allocation::{plan_promotions, promoted_ids, record_promotions, validate_actor};
use super::{Engine, EngineError, EventState, IdReservation, now_ms};

fn validate_len(
    value: &str,
    min: usize,
    max: usize,
    what: &'static str,
) -> Result<String, EngineError> {
    let value = value.trim();
    let len = value.chars().count();
    if len < min {
        return Err(EngineError::Invalid(format!(
            "{what} must be at least {min} characters"
        )));
    }
    if len > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(value.to_string())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if !(MIN_COURT_CAPACITY..=MAX_COURT_CAPACITY).contains(&capacity) {
        return Err(EngineError::Invalid(format!(
            "capacity must be between {MIN_COURT_CAPACITY} and {MAX_COURT_CAPACITY}"
        )));
    }
    Ok(())
}

fn validate_sort_order(sort_order: u32) -> Result<(), EngineError> {
    if sort_order == 0 {
        return Err(EngineError::Invalid("sort_order must be at least 1".into()));
    }
    Ok(())
}

impl Engine {
    async fn require_admin(&self, actor: &ActorId) -> Result<(), EngineError> {
        validate_actor(actor)?;
        if self.gate.is_admin(actor).await {
            Ok(())
        } else {
            Err(EngineError::NotAuthorized)
        }
    }

    fn court_event(&self, court_id: Ulid) -> Result<Ulid, EngineError> {
        self.event_for_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))
    }

    // ── Events ───────────────────────────────────────────────

    pub async fn create_event(
        &self,
        id: Ulid,
        title: &str,
        starts_at: Ms,
        location: &str,
        close_at: Option<Ms>,
        actor: &ActorId,
    ) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        let title = validate_len(title, MIN_TITLE_LEN, MAX_TITLE_LEN, "event title")?;
        let location = validate_len(location, 0, MAX_LOCATION_LEN, "event location")?;
        let _catalog = self.catalog.lock().await;
        if self.events.len() >= MAX_EVENTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        if self.events.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let change = Change::EventCreated {
            id,
            title: title.clone(),
            starts_at,
            location: location.clone(),
            close_at,
        };
        self.wal_append(Commit {
            changes: vec![change.clone()],
        })
        .await?;
        let info = EventInfo {
            id,
            title,
            starts_at,
            location,
            close_at,
            status: EventStatus::Open,
        };
        self.events
            .insert(id, Arc::new(RwLock::new(EventState::new(info))));
        self.notify.publish(&[change]);
        tracing::info!("event {id} created by {actor}");
        Ok(())
    }

    /// CLOSED or FINALIZED back to OPEN.
    pub async fn reopen_event(&self, event_id: Ulid, actor: &ActorId) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        self.transition_event(event_id, EventStatus::Open).await
    }

    /// Stop new registrations. Managers may still move and cancel.
    pub async fn close_event(&self, event_id: Ulid, actor: &ActorId) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        self.transition_event(event_id, EventStatus::Closed).await
    }

    pub async fn finalize_event(&self, event_id: Ulid, actor: &ActorId) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        self.transition_event(event_id, EventStatus::Finalized)
            .await
    }

    /// Apply an explicit status change requested by name (`OPEN`, `CLOSED`, `FINALIZED`).
    pub async fn set_event_status(
        &self,
        event_id: Ulid,
        status: EventStatus,
        actor: &ActorId,
    ) -> Result<(), EngineError> {
        match status {
            EventStatus::Open => self.reopen_event(event_id, actor).await,
            EventStatus::Closed => self.close_event(event_id, actor).await,
            EventStatus::Finalized => self.finalize_event(event_id, actor).await,
        }
    }

    async fn transition_event(&self, event_id: Ulid, to: EventStatus) -> Result<(), EngineError> {
        let mut guard = self.lock_event(event_id).await?;
        let from = guard.info.status;
        match (from, to) {
            (EventStatus::Open, EventStatus::Open) => {
                return Err(EngineError::InvalidTransition("event is already open"));
            }
            (EventStatus::Closed, EventStatus::Closed) => {
                return Err(EngineError::InvalidTransition("event is already closed"));
            }
            (EventStatus::Finalized, EventStatus::Closed) => {
                return Err(EngineError::InvalidTransition(
                    "finalized events must be reopened first",
                ));
            }
            (EventStatus::Finalized, EventStatus::Finalized) => {
                return Err(EngineError::InvalidTransition("event is already finalized"));
            }
            _ => {}
        }
        let change = Change::EventStatusChanged {
            id: event_id,
            status: to,
        };
        let changes = self.commit(&mut guard, vec![change]).await?;
        drop(guard);
        self.notify.publish(&changes);
        tracing::info!("event {event_id}: {} -> {}", from.as_str(), to.as_str());
        Ok(())
    }

    /// Open events whose `close_at` has passed.
    pub fn collect_due_closures(&self, now: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.events.iter() {
            let state = entry.value().clone();
            if let Ok(guard) = state.try_read()
                && guard.info.status == EventStatus::Open
                && guard.info.close_at.is_some_and(|at| at <= now)
            {
                due.push(guard.info.id);
            }
        }
        due
    }

    /// Close an event on schedule. Re-checks under the lock, so a concurrent
    /// reopen or an edited `close_at` wins.
    pub async fn close_if_due(&self, event_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let mut guard = self.lock_event(event_id).await?;
        let due = guard.info.status == EventStatus::Open
            && guard.info.close_at.is_some_and(|at| at <= now);
        if !due {
            return Ok(false);
        }
        let changes = self
            .commit(
                &mut guard,
                vec![Change::EventStatusChanged {
                    id: event_id,
                    status: EventStatus::Closed,
                }],
            )
            .await?;
        drop(guard);
        self.notify.publish(&changes);
        Ok(true)
    }

    // ── Courts ───────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn add_court(
        &self,
        court_id: Ulid,
        event_id: Ulid,
        name: &str,
        capacity: u32,
        is_open: bool,
        sort_order: u32,
        actor: &ActorId,
    ) -> Result<Vec<Ulid>, EngineError> {
        self.require_admin(actor).await?;
        let name = validate_len(name, MIN_COURT_NAME_LEN, MAX_COURT_NAME_LEN, "court name")?;
        validate_capacity(capacity)?;
        validate_sort_order(sort_order)?;
        let reservation = IdReservation::claim(&self.court_to_event, court_id, event_id)?;

        let mut guard = self.lock_event(event_id).await?;
        if guard.info.status == EventStatus::Finalized {
            return Err(EngineError::EventClosed(event_id));
        }
        if guard.ledger.len() >= MAX_COURTS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many courts in event"));
        }

        // A new open court is fresh capacity for whoever is waiting.
        let at = now_ms();
        let seats = if is_open { capacity } else { 0 };
        let mut changes = vec![Change::CourtAdded {
            event_id,
            court_id,
            name,
            capacity,
            is_open,
            sort_order,
        }];
        changes.extend(plan_promotions(&guard, court_id, seats, at));
        let promoted = self.finish_court_change(guard, changes, court_id).await?;
        reservation.commit();
        Ok(promoted)
    }

    /// Edit a court in one commit. Capacity never drops below the seats in use.
    /// Seats that open up, by growing capacity or by reopening, go to the waitlist head.
    pub async fn update_court(
        &self,
        court_id: Ulid,
        patch: CourtPatch,
        actor: &ActorId,
    ) -> Result<Vec<Ulid>, EngineError> {
        self.require_admin(actor).await?;
        let name = patch
            .name
            .as_deref()
            .map(|n| validate_len(n, MIN_COURT_NAME_LEN, MAX_COURT_NAME_LEN, "court name"))
            .transpose()?;
        if let Some(capacity) = patch.capacity {
            validate_capacity(capacity)?;
        }
        if let Some(sort_order) = patch.sort_order {
            validate_sort_order(sort_order)?;
        }
        let event_id = self.court_event(court_id)?;

        let mut guard = self.lock_event(event_id).await?;
        if guard.info.status == EventStatus::Finalized {
            return Err(EngineError::EventClosed(event_id));
        }
        let court = guard
            .ledger
            .court(court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let capacity = patch.capacity.unwrap_or(court.capacity);
        if capacity < court.occupied() {
            return Err(EngineError::Invalid(format!(
                "capacity {capacity} is below the {} seats in use",
                court.occupied()
            )));
        }
        let is_open = patch.is_open.unwrap_or(court.is_open);
        let reopened = is_open && !court.is_open;
        let grown = is_open && capacity > court.capacity;
        let seats = if reopened || grown {
            capacity - court.occupied()
        } else {
            0
        };

        let mut changes = Vec::new();
        if patch.edits_metadata() {
            changes.push(Change::CourtUpdated {
                event_id,
                court_id,
                name: name.unwrap_or_else(|| court.name.clone()),
                capacity,
                sort_order: patch.sort_order.unwrap_or(court.sort_order),
            });
        }
        if is_open != court.is_open {
            changes.push(Change::CourtToggled {
                event_id,
                court_id,
                is_open,
            });
        }
        changes.extend(plan_promotions(&guard, court_id, seats, now_ms()));
        self.finish_court_change(guard, changes, court_id).await
    }

    /// Reopen a court and seat waitlisted registrations into its free seats.
    pub async fn open_court(&self, court_id: Ulid, actor: &ActorId) -> Result<Vec<Ulid>, EngineError> {
        let patch = CourtPatch {
            is_open: Some(true),
            ..CourtPatch::default()
        };
        self.update_court(court_id, patch, actor).await
    }

    /// Stop admitting into a court. Its occupants stay.
    pub async fn close_court(&self, court_id: Ulid, actor: &ActorId) -> Result<(), EngineError> {
        let patch = CourtPatch {
            is_open: Some(false),
            ..CourtPatch::default()
        };
        self.update_court(court_id, patch, actor).await.map(|_| ())
    }

    /// Delete a court that nobody occupies.
    pub async fn remove_court(&self, court_id: Ulid, actor: &ActorId) -> Result<(), EngineError> {
        self.require_admin(actor).await?;
        let event_id = self.court_event(court_id)?;

        let mut guard = self.lock_event(event_id).await?;
        if guard.info.status == EventStatus::Finalized {
            return Err(EngineError::EventClosed(event_id));
        }
        let court = guard
            .ledger
            .court(court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        if court.occupied() > 0 {
            return Err(EngineError::InvalidTransition(
                "court still has confirmed registrations",
            ));
        }
        let changes = self
            .commit(&mut guard, vec![Change::CourtRemoved { event_id, court_id }])
            .await?;
        drop(guard);
        self.notify.publish(&changes);
        tracing::info!("court {court_id} removed from event {event_id}");
        Ok(())
    }

    async fn finish_court_change(
        &self,
        mut guard: tokio::sync::OwnedRwLockWriteGuard<EventState>,
        changes: Vec<Change>,
        court_id: Ulid,
    ) -> Result<Vec<Ulid>, EngineError> {
        let changes = self.commit(&mut guard, changes).await?;
        drop(guard);
        self.notify.publish(&changes);
        record_promotions(&changes);
        let promoted: Vec<Ulid> = promoted_ids(&changes).collect();
        if !promoted.is_empty() {
            tracing::debug!("court {court_id}: promoted {} from waitlist", promoted.len());
        }
        Ok(promoted)
    }

    // ── Captains ─────────────────────────────────────────────

    /// Make `user` a captain of the event. Returns false if they already were.
    pub async fn assign_captain(
        &self,
        event_id: Ulid,
        user: ActorId,
        actor: &ActorId,
    ) -> Result<bool, EngineError> {
        self.require_admin(actor).await?;
        validate_actor(&user)?;

        let mut guard = self.lock_event(event_id).await?;
        if guard.captains.contains(&user) {
            return Ok(false);
        }
        if guard.captains.len() >= MAX_CAPTAINS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many captains in event"));
        }
        let change = Change::CaptainAssigned {
            event_id,
            user_id: user.clone(),
        };
        let changes = self.commit(&mut guard, vec![change]).await?;
        drop(guard);
        self.notify.publish(&changes);
        tracing::info!("captain {user} assigned to event {event_id} by {actor}");
        Ok(true)
    }

    /// Returns false if `user` was not a captain of the event.
    pub async fn remove_captain(
        &self,
        event_id: Ulid,
        user: &ActorId,
        actor: &ActorId,
    ) -> Result<bool, EngineError> {
        self.require_admin(actor).await?;

        let mut guard = self.lock_event(event_id).await?;
        if !guard.captains.contains(user) {
            return Ok(false);
        }
        let change = Change::CaptainRemoved {
            event_id,
            user_id: user.clone(),
        };
        let changes = self.commit(&mut guard, vec![change]).await?;
        drop(guard);
        self.notify.publish(&changes);
        tracing::info!("captain {user} removed from event {event_id} by {actor}");
        Ok(true)
    }

    /// Captains of the event, sorted.
    pub async fn captains(&self, event_id: Ulid) -> Result<Vec<ActorId>, EngineError> {
        let state = self
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = state.read().await;
        Ok(guard.captains.iter().cloned().collect())
    }
}
