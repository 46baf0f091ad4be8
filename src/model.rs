use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Authenticated identity of whoever issues a command (a player, captain or admin).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    /// Accepts new registrations.
    Open,
    /// No new registrations; admins may still move and cancel.
    Closed,
    /// Archived. Only an explicit reopen makes it mutable again.
    Finalized,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Open => "OPEN",
            EventStatus::Closed => "CLOSED",
            EventStatus::Finalized => "FINALIZED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Some(EventStatus::Open),
            "CLOSED" => Some(EventStatus::Closed),
            "FINALIZED" => Some(EventStatus::Finalized),
            _ => None,
        }
    }
}

/// Who occupies the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subject {
    User { user_id: ActorId },
    Guest { name: String },
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::User { .. } => "USER",
            Subject::Guest { .. } => "GUEST",
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Subject::Guest { .. })
    }
}

/// Lifecycle of a registration. The court is carried only while confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Confirmed { court_id: Ulid },
    Waitlisted,
    Cancelled,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Confirmed { .. } => "CONFIRMED",
            RegistrationState::Waitlisted => "WAITLISTED",
            RegistrationState::Cancelled => "CANCELLED",
        }
    }

    pub fn court_id(&self) -> Option<Ulid> {
        match self {
            RegistrationState::Confirmed { court_id } => Some(*court_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub event_id: Ulid,
    pub subject: Subject,
    /// The registering actor. Owner of the registration and of the guest quota.
    pub created_by: ActorId,
    /// Arrival order within the event, assigned under the event lock.
    pub seq: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub state: RegistrationState,
}

impl Registration {
    pub fn owner(&self) -> &ActorId {
        &self.created_by
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, RegistrationState::Cancelled)
    }

    pub fn display_name(&self) -> &str {
        match &self.subject {
            Subject::User { user_id } => user_id.as_str(),
            Subject::Guest { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: Ulid,
    pub title: String,
    pub starts_at: Ms,
    pub location: String,
    /// Registrations close automatically once this instant passes.
    pub close_at: Option<Ms>,
    pub status: EventStatus,
}

/// One committed state change. Compound commands produce several, persisted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated {
        id: Ulid,
        title: String,
        starts_at: Ms,
        location: String,
        close_at: Option<Ms>,
    },
    EventStatusChanged {
        id: Ulid,
        status: EventStatus,
    },
    CourtAdded {
        event_id: Ulid,
        court_id: Ulid,
        name: String,
        capacity: u32,
        is_open: bool,
        sort_order: u32,
    },
    CourtUpdated {
        event_id: Ulid,
        court_id: Ulid,
        name: String,
        capacity: u32,
        sort_order: u32,
    },
    CourtToggled {
        event_id: Ulid,
        court_id: Ulid,
        is_open: bool,
    },
    CourtRemoved {
        event_id: Ulid,
        court_id: Ulid,
    },
    RegistrationCreated {
        event_id: Ulid,
        id: Ulid,
        subject: Subject,
        created_by: ActorId,
        seq: u64,
        at: Ms,
        /// `Some` when admitted straight into a court, `None` when waitlisted.
        court_id: Option<Ulid>,
    },
    RegistrationPromoted {
        event_id: Ulid,
        id: Ulid,
        court_id: Ulid,
        at: Ms,
    },
    RegistrationMoved {
        event_id: Ulid,
        id: Ulid,
        from_court_id: Ulid,
        to_court_id: Ulid,
        at: Ms,
    },
    RegistrationCancelled {
        event_id: Ulid,
        id: Ulid,
        at: Ms,
    },
    CaptainAssigned {
        event_id: Ulid,
        user_id: ActorId,
    },
    CaptainRemoved {
        event_id: Ulid,
        user_id: ActorId,
    },
}

impl Change {
    pub fn event_id(&self) -> Ulid {
        match self {
            Change::EventCreated { id, .. } | Change::EventStatusChanged { id, .. } => *id,
            Change::CourtAdded { event_id, .. }
            | Change::CourtUpdated { event_id, .. }
            | Change::CourtToggled { event_id, .. }
            | Change::CourtRemoved { event_id, .. }
            | Change::RegistrationCreated { event_id, .. }
            | Change::RegistrationPromoted { event_id, .. }
            | Change::RegistrationMoved { event_id, .. }
            | Change::RegistrationCancelled { event_id, .. }
            | Change::CaptainAssigned { event_id, .. }
            | Change::CaptainRemoved { event_id, .. } => *event_id,
        }
    }
}

/// The WAL record: every change of one command, applied all-or-nothing on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub changes: Vec<Change>,
}

/// Court fields an admin may edit in place. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourtPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub sort_order: Option<u32>,
    pub is_open: Option<bool>,
}

impl CourtPatch {
    /// Whether anything besides the open flag changes.
    pub fn edits_metadata(&self) -> bool {
        self.name.is_some() || self.capacity.is_some() || self.sort_order.is_some()
    }
}

// ── Command results ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub registration_id: Ulid,
    pub state: RegistrationState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub registration_id: Ulid,
    pub from_court_id: Ulid,
    pub state: RegistrationState,
    /// Waitlisted registration that took the freed source slot, if any.
    pub promoted: Option<Ulid>,
}

impl Relocation {
    pub fn court_id(&self) -> Option<Ulid> {
        self.state.court_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub registration_id: Ulid,
    pub state: RegistrationState,
    pub promoted: Option<Ulid>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerView {
    pub registration_id: Ulid,
    pub kind: &'static str,
    pub user_id: Option<ActorId>,
    pub name: String,
    pub created_by: ActorId,
    pub created_at: Ms,
}

impl From<&Registration> for PlayerView {
    fn from(reg: &Registration) -> Self {
        Self {
            registration_id: reg.id,
            kind: reg.subject.kind(),
            user_id: match &reg.subject {
                Subject::User { user_id } => Some(user_id.clone()),
                Subject::Guest { .. } => None,
            },
            name: reg.display_name().to_string(),
            created_by: reg.created_by.clone(),
            created_at: reg.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourtView {
    pub court_id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub occupied: u32,
    pub available: u32,
    pub is_open: bool,
    pub sort_order: u32,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSnapshot {
    pub event: EventInfo,
    pub courts: Vec<CourtView>,
    pub waitlist: Vec<PlayerView>,
}
