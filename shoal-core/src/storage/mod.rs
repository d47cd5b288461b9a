//! In-memory segment storage.
//!
//! Segments live only for the lifetime of the loader; persistence across
//! restarts is not supported.

mod segment_cache;

pub use segment_cache::{CacheStats, CachedSegment, LockPredicate, SegmentCache};
