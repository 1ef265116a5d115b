/*
 * This file is a part of Nomos
*/

//! # The on-disk / wire record
//!
//! Both the data and header files (spec §4.1) and the replication frame
//! payload (spec §4.4) share exactly this record shape:
//!
//! ```text
//! cmd       : u8
//! header    : { liveTo:u32, size:u32, tag:u64 }
//! sub_level : serialized per sub_level_type
//! item_key  : serialized per item_type
//! payload   : size bytes, present iff cmd == PUT
//! ```

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::item::ItemHeader;
use crate::engine::key::{Key, KeyType};
use bytes::Bytes;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Unknown = 0,
    Put = 1,
    Touch = 2,
    Remove = 3,
}

impl Cmd {
    pub fn from_byte(b: u8) -> EngineResult<Self> {
        match b {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Put),
            2 => Ok(Self::Touch),
            3 => Ok(Self::Remove),
            _ => Err(EngineError::Corruption(format!("bad cmd byte {b}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub cmd: Cmd,
    pub header: ItemHeader,
    pub sub_level: Key,
    pub item_key: Key,
    /// Present iff `cmd == Put`.
    pub payload: Option<Bytes>,
}

impl Record {
    pub fn put(sub_level: Key, item_key: Key, header: ItemHeader, payload: Bytes) -> Self {
        Self {
            cmd: Cmd::Put,
            header,
            sub_level,
            item_key,
            payload: Some(payload),
        }
    }
    pub fn touch(sub_level: Key, item_key: Key, header: ItemHeader) -> Self {
        Self {
            cmd: Cmd::Touch,
            header: ItemHeader { size: 0, ..header },
            sub_level,
            item_key,
            payload: None,
        }
    }
    pub fn remove(sub_level: Key, item_key: Key, header: ItemHeader) -> Self {
        Self {
            cmd: Cmd::Remove,
            header: ItemHeader { size: 0, ..header },
            sub_level,
            item_key,
            payload: None,
        }
    }

    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&[self.cmd as u8])?;
        w.write_all(&self.header.live_to.to_le_bytes())?;
        w.write_all(&self.header.size.to_le_bytes())?;
        w.write_all(&self.header.tag.to_le_bytes())?;
        self.sub_level.encode_to(w)?;
        self.item_key.encode_to(w)?;
        if let Some(payload) = &self.payload {
            w.write_all(payload)?;
        }
        Ok(())
    }

    /// Number of bytes `encode_to` will write for this record.
    pub fn encoded_len(&self) -> usize {
        1 + 4 + 4 + 8
            + key_encoded_len(&self.sub_level)
            + key_encoded_len(&self.item_key)
            + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    pub fn decode_from<R: Read>(
        r: &mut R,
        sub_level_type: KeyType,
        item_type: KeyType,
    ) -> EngineResult<Self> {
        let mut cmd_buf = [0u8; 1];
        r.read_exact(&mut cmd_buf)
            .map_err(|e| EngineError::Corruption(format!("record cmd: {e}")))?;
        let cmd = Cmd::from_byte(cmd_buf[0])?;

        let mut live_to_buf = [0u8; 4];
        let mut size_buf = [0u8; 4];
        let mut tag_buf = [0u8; 8];
        r.read_exact(&mut live_to_buf)
            .map_err(|e| EngineError::Corruption(format!("record liveTo: {e}")))?;
        r.read_exact(&mut size_buf)
            .map_err(|e| EngineError::Corruption(format!("record size: {e}")))?;
        r.read_exact(&mut tag_buf)
            .map_err(|e| EngineError::Corruption(format!("record tag: {e}")))?;
        let header = ItemHeader {
            live_to: u32::from_le_bytes(live_to_buf),
            size: u32::from_le_bytes(size_buf),
            tag: u64::from_le_bytes(tag_buf),
        };

        let sub_level = Key::decode_from(r, sub_level_type)?;
        let item_key = Key::decode_from(r, item_type)?;

        let payload = if cmd == Cmd::Put {
            if header.size as usize > super::MAX_ITEM_SIZE {
                return Err(EngineError::Corruption("item size absurd".into()));
            }
            let mut buf = vec![0u8; header.size as usize];
            r.read_exact(&mut buf)
                .map_err(|e| EngineError::Corruption(format!("record payload: {e}")))?;
            Some(Bytes::from(buf))
        } else {
            None
        };

        Ok(Self {
            cmd,
            header,
            sub_level,
            item_key,
            payload,
        })
    }
}

fn key_encoded_len(key: &Key) -> usize {
    match key {
        Key::Str(s) => 4 + s.len(),
        Key::U32(_) => 4,
        Key::U64(_) => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tag::pack;

    #[test]
    fn put_record_roundtrips() {
        let header = ItemHeader {
            live_to: 0,
            size: 7,
            tag: pack(1_000_000, 3),
        };
        let rec = Record::put(
            Key::U32(1),
            Key::Str("k".into()),
            header,
            Bytes::from_static(b"1234567"),
        );
        let mut buf = Vec::new();
        rec.encode_to(&mut buf).unwrap();
        assert_eq!(buf.len(), rec.encoded_len());
        let mut cur = &buf[..];
        let back = Record::decode_from(&mut cur, KeyType::U32, KeyType::Str).unwrap();
        assert_eq!(back.cmd, Cmd::Put);
        assert_eq!(back.header, header);
        assert_eq!(back.sub_level, Key::U32(1));
        assert_eq!(back.item_key, Key::Str("k".into()));
        assert_eq!(back.payload.unwrap(), Bytes::from_static(b"1234567"));
    }

    #[test]
    fn touch_record_has_no_payload() {
        let header = ItemHeader {
            live_to: 50,
            size: 0,
            tag: pack(1_000_000, 9),
        };
        let rec = Record::touch(Key::U32(1), Key::Str("k".into()), header);
        let mut buf = Vec::new();
        rec.encode_to(&mut buf).unwrap();
        let mut cur = &buf[..];
        let back = Record::decode_from(&mut cur, KeyType::U32, KeyType::Str).unwrap();
        assert_eq!(back.cmd, Cmd::Touch);
        assert!(back.payload.is_none());
    }
}
