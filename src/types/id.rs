use std::fmt;

/// Generation-checked handle to a bus slot in the engine's arena.
///
/// A `BusId` held across a detach/re-attach cycle goes stale: the slot's
/// generation moves on and lookups with the old id fail instead of
/// resolving to the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct BusId {
    index: usize,
    generation: u64,
}

impl BusId {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Slot generation at the time this id was issued.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XBUS-{:02}", self.index)
    }
}
