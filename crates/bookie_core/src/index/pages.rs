//! Paged views of a ledger's entry locations.

use crate::error::CoreResult;
use crate::types::LogLocation;

/// A fixed-size page of entry locations.
///
/// Slot `i` holds the location of entry `first_entry + i`; `0` marks an
/// empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    first_entry: i64,
    slots: Vec<u64>,
}

impl IndexPage {
    /// Creates an empty page of `size` slots starting at `first_entry`.
    #[must_use]
    pub fn new(first_entry: i64, size: usize) -> Self {
        Self {
            first_entry,
            slots: vec![0; size],
        }
    }

    /// Rebuilds a page from persisted slots.
    #[must_use]
    pub fn from_slots(first_entry: i64, slots: Vec<u64>) -> Self {
        Self { first_entry, slots }
    }

    /// Entry id of slot 0.
    #[must_use]
    pub fn first_entry(&self) -> i64 {
        self.first_entry
    }

    /// Number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Raw slots.
    #[must_use]
    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// Location of `entry_id`, if the page covers it and the slot is used.
    #[must_use]
    pub fn get(&self, entry_id: i64) -> Option<LogLocation> {
        let slot = usize::try_from(entry_id.checked_sub(self.first_entry)?).ok()?;
        match self.slots.get(slot) {
            Some(&0) | None => None,
            Some(&value) => Some(LogLocation::from_u64(value)),
        }
    }

    /// Stores the location of `entry_id`. Returns false if the page does not
    /// cover the entry.
    pub fn set(&mut self, entry_id: i64, location: LogLocation) -> bool {
        let Some(slot) = entry_id
            .checked_sub(self.first_entry)
            .and_then(|s| usize::try_from(s).ok())
        else {
            return false;
        };
        match self.slots.get_mut(slot) {
            Some(value) => {
                *value = location.as_u64();
                true
            }
            None => false,
        }
    }

    /// Used slots as `(entryId, location)`, ascending.
    pub fn entries(&self) -> impl Iterator<Item = (i64, LogLocation)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value != 0)
            .map(|(i, &value)| (self.first_entry + i as i64, LogLocation::from_u64(value)))
    }

    /// Highest used slot.
    #[must_use]
    pub fn last_entry(&self) -> Option<(i64, LogLocation)> {
        self.entries().last()
    }
}

/// A restartable source of index pages for one ledger.
///
/// Each call to [`PageEntriesIterable::pages`] starts a fresh pass.
/// Producing a page may fail, for instance when it has to be read from
/// disk.
pub trait PageEntriesIterable: Send + Sync {
    /// Ledger the pages belong to.
    fn ledger_id(&self) -> i64;

    /// Starts a pass over the pages.
    fn pages(&self) -> Box<dyn Iterator<Item = CoreResult<IndexPage>> + '_>;
}

/// Pages captured in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntriesSnapshot {
    ledger_id: i64,
    pages: Vec<IndexPage>,
}

impl PageEntriesSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(ledger_id: i64, pages: Vec<IndexPage>) -> Self {
        Self { ledger_id, pages }
    }

    /// Number of pages captured.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

impl PageEntriesIterable for PageEntriesSnapshot {
    fn ledger_id(&self) -> i64 {
        self.ledger_id
    }

    fn pages(&self) -> Box<dyn Iterator<Item = CoreResult<IndexPage>> + '_> {
        Box::new(self.pages.iter().cloned().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cover_page_range() {
        let mut page = IndexPage::new(100, 4);
        assert!(page.set(100, LogLocation::new(1, 4096)));
        assert!(page.set(103, LogLocation::new(1, 5000)));
        assert!(!page.set(104, LogLocation::new(1, 6000)));
        assert!(!page.set(99, LogLocation::new(1, 6000)));

        assert_eq!(page.get(103), Some(LogLocation::new(1, 5000)));
        assert_eq!(page.get(101), None);
        assert_eq!(page.get(500), None);

        let ids: Vec<_> = page.entries().map(|(e, _)| e).collect();
        assert_eq!(ids, vec![100, 103]);
        assert_eq!(page.last_entry().unwrap().0, 103);
    }

    #[test]
    fn snapshot_restarts() {
        let mut page = IndexPage::new(0, 2);
        page.set(1, LogLocation::new(2, 4096));
        let snapshot = PageEntriesSnapshot::new(9, vec![page]);

        assert_eq!(snapshot.pages().count(), 1);
        assert_eq!(snapshot.pages().count(), 1);
        assert_eq!(snapshot.ledger_id(), 9);
    }
}
