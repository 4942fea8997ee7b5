//! Small standalone utilities that sit alongside the reactor core.

pub mod ttl_cache;
