/*
 * This file is a part of Nomos
*/

//! Tagged-variant key, per the spec's own design note (§9): rather than the
//! original's per-type class instantiation, every sub-level and item key is
//! one `Key` value and every shard is the same generic map. This avoids
//! monomorphizing the whole engine three times over and keeps the
//! replication wire path free of type-erasure tricks.

use crate::engine::error::{EngineError, EngineResult};
use std::io::{Read, Write};

/// The three key shapes a top-level can be configured with, fixed for that
/// top-level's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Str = 0,
    U32 = 1,
    U64 = 2,
}

impl KeyType {
    pub fn from_byte(b: u8) -> EngineResult<Self> {
        match b {
            0 => Ok(Self::Str),
            1 => Ok(Self::U32),
            2 => Ok(Self::U64),
            _ => Err(EngineError::Corruption(format!("bad key type byte {b}"))),
        }
    }
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(String),
    U32(u32),
    U64(u64),
}

impl Key {
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Str(_) => KeyType::Str,
            Self::U32(_) => KeyType::U32,
            Self::U64(_) => KeyType::U64,
        }
    }

    /// Serialize per spec §4.1: `STRING` = u32 length + raw bytes;
    /// `U32`/`U64` = little-endian fixed width. No type tag is written --
    /// the reader already knows the expected type from the top-level's
    /// `MetaData`.
    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Self::Str(s) => {
                let bytes = s.as_bytes();
                w.write_all(&(bytes.len() as u32).to_le_bytes())?;
                w.write_all(bytes)
            }
            Self::U32(v) => w.write_all(&v.to_le_bytes()),
            Self::U64(v) => w.write_all(&v.to_le_bytes()),
        }
    }

    pub fn decode_from<R: Read>(r: &mut R, ty: KeyType) -> EngineResult<Self> {
        match ty {
            KeyType::Str => {
                let mut lenbuf = [0u8; 4];
                r.read_exact(&mut lenbuf)
                    .map_err(|e| EngineError::Corruption(format!("key length: {e}")))?;
                let len = u32::from_le_bytes(lenbuf) as usize;
                if len > super::MAX_ITEM_SIZE {
                    return Err(EngineError::Corruption("key length absurd".into()));
                }
                let mut buf = vec![0u8; len];
                r.read_exact(&mut buf)
                    .map_err(|e| EngineError::Corruption(format!("key bytes: {e}")))?;
                String::from_utf8(buf)
                    .map(Key::Str)
                    .map_err(|_| EngineError::Corruption("key is not utf8".into()))
            }
            KeyType::U32 => {
                let mut buf = [0u8; 4];
                r.read_exact(&mut buf)
                    .map_err(|e| EngineError::Corruption(format!("key u32: {e}")))?;
                Ok(Key::U32(u32::from_le_bytes(buf)))
            }
            KeyType::U64 => {
                let mut buf = [0u8; 8];
                r.read_exact(&mut buf)
                    .map_err(|e| EngineError::Corruption(format!("key u64: {e}")))?;
                Ok(Key::U64(u64::from_le_bytes(buf)))
            }
        }
    }

    /// Byte representation used only to compute the shard checksum; this is
    /// not the on-disk encoding (no length prefix is needed here since the
    /// hash doesn't need to be reversible).
    fn hash_bytes(&self) -> Vec<u8> {
        match self {
            Self::Str(s) => s.as_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// checksum32(item_key) mod N -- the shard selector. Grounded in the
/// replication wire format's own use of plain CRC-32 elsewhere in the
/// corpus (the `crc` crate, as already pulled in by the teacher stack).
pub fn checksum32(key: &Key) -> u32 {
    const CKSUM: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    CKSUM.checksum(&key.hash_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_key_roundtrips() {
        let k = Key::Str("hello world".into());
        let mut buf = Vec::new();
        k.encode_to(&mut buf).unwrap();
        let mut cur = &buf[..];
        let k2 = Key::decode_from(&mut cur, KeyType::Str).unwrap();
        assert_eq!(k, k2);
    }

    #[test]
    fn u32_key_roundtrips() {
        let k = Key::U32(0xdead_beef);
        let mut buf = Vec::new();
        k.encode_to(&mut buf).unwrap();
        let mut cur = &buf[..];
        let k2 = Key::decode_from(&mut cur, KeyType::U32).unwrap();
        assert_eq!(k, k2);
    }

    #[test]
    fn checksum_is_stable() {
        let k = Key::Str("apples".into());
        assert_eq!(checksum32(&k), checksum32(&Key::Str("apples".into())));
    }
}
