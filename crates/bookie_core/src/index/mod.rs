//! Persistent indexes.
//!
//! - [`EntryLocationIndex`] - where every flushed entry lives
//! - [`LedgerMetadataIndex`] - master key, fencing, limbo and explicit LAC per
//!   ledger, plus storage state flags
//! - [`IndexPage`] / [`PageEntriesIterable`] - paged location views used for
//!   bulk index rebuilds

mod location;
mod metadata;
mod pages;

pub use location::EntryLocationIndex;
pub use metadata::{LedgerData, LedgerMetadataIndex};
pub use pages::{IndexPage, PageEntriesIterable, PageEntriesSnapshot};
