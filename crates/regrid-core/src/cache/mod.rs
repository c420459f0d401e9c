//! Persistent weight/area cache.

mod entry;
mod key;
mod lock;
mod memory;
mod negative;
mod store;

pub use entry::{CacheEntryMeta, FORMAT_VERSION};
pub use key::{CacheKey, EntryKind};
pub use store::{CacheSettings, EntryInfo, StagedEntry, WeightCache};
