use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The event does not admit this command in its current status.
    EventClosed(Ulid),
    CourtClosed(Ulid),
    /// The actor already holds an active registration of their own in the event.
    AlreadyRegistered(Ulid),
    GuestQuotaExceeded(usize),
    DestinationFull(Ulid),
    NotAuthorized,
    /// The event lock could not be taken in time. Safe to retry.
    Busy(Ulid),
    InvalidTransition(&'static str),
    Invalid(String),
    LimitExceeded(&'static str),
    /// Durable storage failed; the command was not applied.
    Storage(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) | EngineError::AlreadyRegistered(_) => "23505",
            EngineError::EventClosed(_)
            | EngineError::CourtClosed(_)
            | EngineError::InvalidTransition(_) => "55000",
            EngineError::GuestQuotaExceeded(_)
            | EngineError::DestinationFull(_)
            | EngineError::LimitExceeded(_) => "54000",
            EngineError::NotAuthorized => "42501",
            EngineError::Busy(_) => "55P03",
            EngineError::Invalid(_) => "22023",
            EngineError::Storage(_) => "XX000",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::EventClosed(_) => "event_closed",
            EngineError::CourtClosed(_) => "court_closed",
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::GuestQuotaExceeded(_) => "guest_quota_exceeded",
            EngineError::DestinationFull(_) => "destination_full",
            EngineError::NotAuthorized => "not_authorized",
            EngineError::Busy(_) => "busy",
            EngineError::InvalidTransition(_) => "invalid_transition",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EventClosed(id) => {
                write!(f, "event {id} is not accepting this change")
            }
            EngineError::CourtClosed(id) => write!(f, "court {id} is closed"),
            EngineError::AlreadyRegistered(id) => {
                write!(f, "already registered in this event as {id}")
            }
            EngineError::GuestQuotaExceeded(max) => {
                write!(f, "guest limit of {max} reached for this event")
            }
            EngineError::DestinationFull(id) => write!(f, "destination court {id} is full"),
            EngineError::NotAuthorized => {
                write!(f, "not authorized: requires admin or event captain")
            }
            EngineError::Busy(id) => write!(f, "event {id} is busy, retry shortly"),
            EngineError::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
