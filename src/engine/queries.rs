use ulid::Ulid;

use crate::model::*;

use super::{CourtSlot, Engine, EngineError, EventState};

fn court_view(state: &EventState, court: &CourtSlot, players: Vec<PlayerView>) -> CourtView {
    CourtView {
        court_id: court.id,
        name: court.name.clone(),
        capacity: court.capacity,
        occupied: court.occupied(),
        available: state.ledger.available(court.id),
        is_open: court.is_open,
        sort_order: court.sort_order,
        players,
    }
}

fn build_snapshot(state: &EventState) -> EventSnapshot {
    let courts = state
        .ledger
        .courts()
        .iter()
        .map(|court| {
            let players = state
                .ledger
                .occupants(court.id)
                .into_iter()
                .filter_map(|id| state.store.get(id))
                .map(PlayerView::from)
                .collect();
            court_view(state, court, players)
        })
        .collect();
    let waitlist = state
        .store
        .list_waitlisted()
        .into_iter()
        .map(PlayerView::from)
        .collect();
    EventSnapshot {
        event: state.info.clone(),
        courts,
        waitlist,
    }
}

impl Engine {
    /// Consistent view of one event: courts in display order with their
    /// players, then the waitlist, both in arrival order.
    pub async fn snapshot(&self, event_id: Ulid) -> Result<EventSnapshot, EngineError> {
        let state = self
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = state.read().await;
        Ok(build_snapshot(&guard))
    }

    /// One court with its confirmed players in arrival order, plus the owning event.
    pub async fn court_players(&self, court_id: Ulid) -> Result<(Ulid, CourtView), EngineError> {
        let event_id = self
            .event_for_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let state = self
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = state.read().await;
        let court = guard
            .ledger
            .court(court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let players = guard
            .store
            .list_by_court(court_id)
            .into_iter()
            .map(PlayerView::from)
            .collect();
        Ok((event_id, court_view(&guard, court, players)))
    }

    /// Every event of the tenant, soonest first.
    pub async fn list_events(&self) -> Vec<EventInfo> {
        let states: Vec<_> = self.events.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for state in states {
            out.push(state.read().await.info.clone());
        }
        out.sort_by_key(|e| (e.starts_at, e.id));
        out
    }

    pub async fn get_registration(&self, registration_id: Ulid) -> Result<Registration, EngineError> {
        let event_id = self
            .event_for_registration(&registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;
        let state = self
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let guard = state.read().await;
        guard
            .store
            .get(registration_id)
            .cloned()
            .ok_or(EngineError::NotFound(registration_id))
    }
}
