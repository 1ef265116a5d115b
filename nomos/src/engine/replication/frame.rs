/*
 * This file is a part of Nomos
*/

//! The replication wire frame (spec §4.4): a header naming the origin server
//! and the byte count that follows, then the top-level name and a run of
//! records sharing that origin.

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::meta::MetaData;
use crate::engine::record::Record;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy)]
pub struct ReplicationPacketHeader {
    pub server_id: u32,
    pub meta: MetaData,
    pub packet_size: u32,
}

impl ReplicationPacketHeader {
    pub const ENCODED_LEN: usize = 4 + 3 + 4;

    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.server_id.to_le_bytes())?;
        self.meta.write_to(w)?;
        w.write_all(&self.packet_size.to_le_bytes())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut server_id_buf = [0u8; 4];
        r.read_exact(&mut server_id_buf)
            .map_err(|e| EngineError::Corruption(format!("packet header server_id: {e}")))?;
        let meta = MetaData::read_from(r)?;
        let mut size_buf = [0u8; 4];
        r.read_exact(&mut size_buf)
            .map_err(|e| EngineError::Corruption(format!("packet header size: {e}")))?;
        Ok(Self {
            server_id: u32::from_le_bytes(server_id_buf),
            meta,
            packet_size: u32::from_le_bytes(size_buf),
        })
    }
}

/// A single decoded frame: the header, the top-level it targets, and the
/// records it carries.
pub struct Frame {
    pub header: ReplicationPacketHeader,
    pub top_level: String,
    pub records: Vec<Record>,
}

/// Build the on-wire bytes for one frame out of a batch of already-mutated
/// records belonging to a single top-level.
pub fn encode_frame(
    server_id: u32,
    meta: MetaData,
    top_level: &str,
    records: &[Record],
) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    payload.write_all(&(top_level.len() as u32).to_le_bytes())?;
    payload.write_all(top_level.as_bytes())?;
    for record in records {
        record.encode_to(&mut payload)?;
    }

    let header = ReplicationPacketHeader {
        server_id,
        meta,
        packet_size: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(ReplicationPacketHeader::ENCODED_LEN + payload.len());
    header.encode_to(&mut out)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame starting at the current reader position. Returns `Ok(None)`
/// on a clean EOF (no more frames in this buffer).
pub fn decode_frame<R: Read>(r: &mut R) -> EngineResult<Option<Frame>> {
    let header = match ReplicationPacketHeader::decode_from(r) {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };

    let mut taken = r.take(header.packet_size as u64);

    let mut name_len_buf = [0u8; 4];
    taken
        .read_exact(&mut name_len_buf)
        .map_err(|e| EngineError::Corruption(format!("frame top_level length: {e}")))?;
    let name_len = u32::from_le_bytes(name_len_buf) as usize;
    if name_len > super::super::MAX_TOP_LEVEL_NAME_LENGTH {
        return Err(EngineError::Corruption("frame top_level name absurd".into()));
    }
    let mut name_buf = vec![0u8; name_len];
    taken
        .read_exact(&mut name_buf)
        .map_err(|e| EngineError::Corruption(format!("frame top_level bytes: {e}")))?;
    let top_level = String::from_utf8(name_buf)
        .map_err(|_| EngineError::Corruption("frame top_level not utf8".into()))?;

    let sub_type = header.meta.sub_level_key_type()?;
    let item_type = header.meta.item_key_type()?;
    let mut records = Vec::new();
    loop {
        match Record::decode_from(&mut taken, sub_type, item_type) {
            Ok(rec) => records.push(rec),
            Err(_) => break,
        }
    }

    Ok(Some(Frame {
        header,
        top_level,
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::item::ItemHeader;
    use crate::engine::key::{Key, KeyType};
    use crate::engine::tag::pack;
    use bytes::Bytes;

    #[test]
    fn frame_roundtrips() {
        let meta = MetaData::new(KeyType::U32, KeyType::Str);
        let header = ItemHeader {
            live_to: 0,
            size: 7,
            tag: pack(1_000_000, 1),
        };
        let rec = Record::put(
            Key::U32(1),
            Key::Str("k".into()),
            header,
            Bytes::from_static(b"1234567"),
        );
        let bytes = encode_frame(1, meta, "t", &[rec]).unwrap();
        let mut cur = &bytes[..];
        let frame = decode_frame(&mut cur).unwrap().unwrap();
        assert_eq!(frame.header.server_id, 1);
        assert_eq!(frame.top_level, "t");
        assert_eq!(frame.records.len(), 1);
    }
}
