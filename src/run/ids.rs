//! Test identifiers owned by a run

use std::collections::HashSet;
use uuid::Uuid;

/// Hands out identifiers unique among the live tests of one run
#[derive(Debug, Default)]
pub struct IdentifierAllocator {
    in_use: HashSet<Uuid>,
}

impl IdentifierAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> Uuid {
        loop {
            let uuid = Uuid::new_v4();
            if self.in_use.insert(uuid) {
                return uuid;
            }
        }
    }

    /// Returns false when the identifier was not in use
    pub fn release(&mut self, uuid: &Uuid) -> bool {
        self.in_use.remove(uuid)
    }

    pub fn is_in_use(&self, uuid: &Uuid) -> bool {
        self.in_use.contains(uuid)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}
