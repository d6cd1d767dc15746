//! Cache implementations for grid loading.

mod source_cache;

pub use source_cache::SourceCache;
