use ulid::Ulid;

/// One court and the confirmed registrations occupying it.
#[derive(Debug, Clone)]
pub struct CourtSlot {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub is_open: bool,
    pub sort_order: u32,
    /// `(arrival seq, registration id)`, sorted by seq.
    occupants: Vec<(u64, Ulid)>,
}

impl CourtSlot {
    pub fn new(id: Ulid, name: String, capacity: u32, is_open: bool, sort_order: u32) -> Self {
        Self {
            id,
            name,
            capacity,
            is_open,
            sort_order,
            occupants: Vec::new(),
        }
    }

    pub fn occupied(&self) -> u32 {
        self.occupants.len() as u32
    }

    /// Free seats, whether or not the court is currently open.
    pub fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.occupied())
    }

    pub fn occupant_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.occupants.iter().map(|(_, id)| *id)
    }
}

/// Per-court occupancy. `try_reserve` and `release` are the only writers.
#[derive(Debug, Clone, Default)]
pub struct CapacityLedger {
    courts: Vec<CourtSlot>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_court(&mut self, slot: CourtSlot) {
        self.courts.push(slot);
        self.courts.sort_by_key(|c| (c.sort_order, c.id));
    }

    pub fn remove_court(&mut self, id: Ulid) -> Option<CourtSlot> {
        let pos = self.courts.iter().position(|c| c.id == id)?;
        Some(self.courts.remove(pos))
    }

    pub fn court(&self, id: Ulid) -> Option<&CourtSlot> {
        self.courts.iter().find(|c| c.id == id)
    }

    /// Mutable access for metadata edits. Occupancy stays private to the ledger.
    pub fn court_mut(&mut self, id: Ulid) -> Option<&mut CourtSlot> {
        self.courts.iter_mut().find(|c| c.id == id)
    }

    pub fn resort(&mut self) {
        self.courts.sort_by_key(|c| (c.sort_order, c.id));
    }

    /// Courts in display order.
    pub fn courts(&self) -> &[CourtSlot] {
        &self.courts
    }

    pub fn len(&self) -> usize {
        self.courts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courts.is_empty()
    }

    /// Seats a new registration could take right now. Zero for closed or unknown courts.
    pub fn available(&self, court_id: Ulid) -> u32 {
        match self.court(court_id) {
            Some(c) if c.is_open => c.free(),
            _ => 0,
        }
    }

    /// Seat a registration. False (and no change) if the court is unknown, closed or full.
    pub fn try_reserve(&mut self, court_id: Ulid, seq: u64, registration_id: Ulid) -> bool {
        let Some(court) = self.court_mut(court_id) else {
            return false;
        };
        if !court.is_open || court.free() == 0 {
            return false;
        }
        let pos = court
            .occupants
            .binary_search_by_key(&seq, |(s, _)| *s)
            .unwrap_or_else(|e| e);
        court.occupants.insert(pos, (seq, registration_id));
        true
    }

    /// Free the seat held by a registration. No-op if it holds none here.
    pub fn release(&mut self, court_id: Ulid, registration_id: Ulid) -> bool {
        let Some(court) = self.court_mut(court_id) else {
            return false;
        };
        match court.occupants.iter().position(|(_, id)| *id == registration_id) {
            Some(pos) => {
                court.occupants.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Confirmed registrations on the court, in arrival order.
    pub fn occupants(&self, court_id: Ulid) -> Vec<Ulid> {
        self.court(court_id)
            .map(|c| c.occupant_ids().collect())
            .unwrap_or_default()
    }
}
