/*
 * This file is a part of Nomos
 * Nomos is a persistent, high-throughput key/value store with a
 * hierarchical namespace and multi-master replication.
 *
*/

//! # Nomos
//!
//! `nomos` is the library crate behind the `nomosd` binary: a sharded,
//! append-only key/value engine with a three-level namespace, expiring
//! items and binary multi-master replication. See `engine` for the storage
//! and replication internals, `net` for the client-facing protocol and
//! `config` for how a running server is configured.

pub mod config;
pub mod engine;
pub mod net;
pub mod registry;

#[cfg(test)]
mod tests;
