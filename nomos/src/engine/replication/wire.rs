/*
 * This file is a part of Nomos
*/

//! The small control messages exchanged between a `ReplicationPeerClient`
//! and a `ReplicationPeerServer`, distinct from the `ReplicationLog`'s own
//! on-disk frame format (see `frame.rs`).

use crate::engine::error::{EngineError, EngineResult};
use std::io::{Read, Write};

pub const PROTOCOL_VERSION: u8 = 1;
pub const CMD_READ_BIN_LOG: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub struct SenderHandshakeRequest {
    pub version: u8,
    pub cmd: u8,
    pub from_server_id: u32,
}

impl SenderHandshakeRequest {
    pub fn new(from_server_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            cmd: CMD_READ_BIN_LOG,
            from_server_id,
        }
    }

    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&[self.version, self.cmd])?;
        w.write_all(&self.from_server_id.to_le_bytes())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut head = [0u8; 2];
        r.read_exact(&mut head)
            .map_err(|e| EngineError::Corruption(format!("handshake head: {e}")))?;
        let mut id_buf = [0u8; 4];
        r.read_exact(&mut id_buf)
            .map_err(|e| EngineError::Corruption(format!("handshake server id: {e}")))?;
        Ok(Self {
            version: head[0],
            cmd: head[1],
            from_server_id: u32::from_le_bytes(id_buf),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadBinLogRequest {
    pub segment_number: u32,
    pub offset: u32,
}

impl ReadBinLogRequest {
    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.segment_number.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut seg_buf = [0u8; 4];
        let mut off_buf = [0u8; 4];
        r.read_exact(&mut seg_buf)
            .map_err(|e| EngineError::Corruption(format!("read request segment: {e}")))?;
        r.read_exact(&mut off_buf)
            .map_err(|e| EngineError::Corruption(format!("read request offset: {e}")))?;
        Ok(Self {
            segment_number: u32::from_le_bytes(seg_buf),
            offset: u32::from_le_bytes(off_buf),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadBinLogAnswer {
    pub segment_number: u32,
    pub offset: u32,
    pub size: u32,
}

impl ReadBinLogAnswer {
    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.segment_number.to_le_bytes())?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.size.to_le_bytes())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut seg_buf = [0u8; 4];
        let mut off_buf = [0u8; 4];
        let mut size_buf = [0u8; 4];
        r.read_exact(&mut seg_buf)
            .map_err(|e| EngineError::Corruption(format!("read answer segment: {e}")))?;
        r.read_exact(&mut off_buf)
            .map_err(|e| EngineError::Corruption(format!("read answer offset: {e}")))?;
        r.read_exact(&mut size_buf)
            .map_err(|e| EngineError::Corruption(format!("read answer size: {e}")))?;
        Ok(Self {
            segment_number: u32::from_le_bytes(seg_buf),
            offset: u32::from_le_bytes(off_buf),
            size: u32::from_le_bytes(size_buf),
        })
    }
}
