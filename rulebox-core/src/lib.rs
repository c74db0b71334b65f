//! Rulebox core: the registry cache engine

pub mod cache;
pub mod error;

pub use error::{CacheError, Result};
