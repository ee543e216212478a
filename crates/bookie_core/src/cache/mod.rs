//! In-memory entry caches.

mod read_cache;
mod write_cache;

pub use read_cache::ReadCache;
pub use write_cache::{Generation, WriteCache};
