//! Provenance: canonical BLAKE3 hashing and the apply event log.

pub mod eventlog;
pub mod hasher;
