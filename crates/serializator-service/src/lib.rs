//! A keyed object cache persisting objects as properties files.
//!
//! The main entry point is the [`Serializator`](caching::Serializator), which serializes objects
//! to files, deserializes them, and deduplicates concurrent loads of the same key.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod marshal;
pub mod pool;
pub mod utils;

#[cfg(any(feature = "test", test))]
pub mod test;
