//! Persist and retrieve the sift search engine's index data on disk.
//!
//! # Status
//!
//! `sift-storage` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod checksum;
pub mod region;
pub mod vector;
