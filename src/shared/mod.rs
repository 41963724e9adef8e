//! Usage: Cross-cutting utilities shared across layers (blocking bridge, fs, locking, clocks).

pub(crate) mod blocking;
pub(crate) mod fs;
pub(crate) mod mutex_ext;
pub(crate) mod time;
