//! Hard limits enforced at the engine boundary.

/// Non-cancelled guests a single actor may hold in one event.
pub const MAX_GUESTS_PER_ACTOR: usize = 5;

pub const MIN_COURT_CAPACITY: u32 = 1;
pub const MAX_COURT_CAPACITY: u32 = 50;

pub const MIN_GUEST_NAME_LEN: usize = 2;
pub const MAX_GUEST_NAME_LEN: usize = 60;

pub const MIN_COURT_NAME_LEN: usize = 2;
pub const MAX_COURT_NAME_LEN: usize = 60;

pub const MIN_TITLE_LEN: usize = 3;
pub const MAX_TITLE_LEN: usize = 120;
pub const MAX_LOCATION_LEN: usize = 120;

pub const MAX_ACTOR_ID_LEN: usize = 128;

pub const MAX_EVENTS_PER_TENANT: usize = 10_000;
pub const MAX_COURTS_PER_EVENT: usize = 64;
pub const MAX_CAPTAINS_PER_EVENT: usize = 32;
pub const MAX_REGISTRATIONS_PER_EVENT: usize = 5_000;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Upper bound on one wire statement, lock waits included.
pub const STATEMENT_TIMEOUT_MS: u64 = 5_000;
