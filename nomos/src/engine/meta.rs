/*
 * This file is a part of Nomos
*/

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::key::KeyType;
use std::io::{Read, Write};

pub const CURRENT_VERSION: u8 = 1;

/// The 3-byte header every `.meta` file, data file and header file begins
/// with. No padding -- this is read and written as exactly three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaData {
    pub version: u8,
    pub sub_level_type: u8,
    pub item_type: u8,
}

impl MetaData {
    pub fn new(sub_level_type: KeyType, item_type: KeyType) -> Self {
        Self {
            version: CURRENT_VERSION,
            sub_level_type: sub_level_type.as_byte(),
            item_type: item_type.as_byte(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&[self.version, self.sub_level_type, self.item_type])
    }

    pub fn read_from<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf)
            .map_err(|e| EngineError::Corruption(format!("meta: {e}")))?;
        Ok(Self {
            version: buf[0],
            sub_level_type: buf[1],
            item_type: buf[2],
        })
    }

    pub fn sub_level_key_type(&self) -> EngineResult<KeyType> {
        KeyType::from_byte(self.sub_level_type)
    }
    pub fn item_key_type(&self) -> EngineResult<KeyType> {
        KeyType::from_byte(self.item_type)
    }

    /// Check this metadata (usually read off some segment file) against the
    /// top-level's current, authoritative metadata.
    pub fn check_compatible(&self, authoritative: &MetaData) -> EngineResult<()> {
        if self.sub_level_type != authoritative.sub_level_type
            || self.item_type != authoritative.item_type
        {
            return Err(EngineError::VersionMismatch {
                expected: (authoritative.sub_level_type, authoritative.item_type),
                found: (self.sub_level_type, self.item_type),
            });
        }
        Ok(())
    }
}
