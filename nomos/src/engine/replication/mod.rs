/*
 * This file is a part of Nomos
*/

//! Binary multi-master replication: an append-only log of framed mutations
//! per node, with peer threads shipping and applying frames across nodes.

pub mod client;
pub mod frame;
pub mod log;
pub mod server;
pub mod wire;

pub use client::{FrameSink, ReplicationPeerClient};
pub use log::{Cursor, ReplicationLog};
pub use server::ReplicationPeerServer;
