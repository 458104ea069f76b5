// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! fmt_key {
    ($name:literal) => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.is_null() {
                write!(f, concat!($name, "(null)"))
            } else {
                write!(f, concat!($name, "({})"), self.0)
            }
        }
    };
}

/// Key of a top-level table. The null value keeps the top bit free so the key
/// can round-trip through a signed column.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey(pub i64);

impl TableKey {
    pub const NULL: TableKey = TableKey((u64::MAX >> 1) as i64);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl Default for TableKey {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for TableKey {
    fmt_key!("TableKey");
}

/// Type discriminant packed into a `ColKey`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Int = 0,
    Bool = 1,
    String = 2,
    Binary = 3,
    Double = 4,
    Timestamp = 5,
    Link = 6,
    LinkList = 7,
}

impl ColumnType {
    pub fn is_link(self) -> bool {
        matches!(self, ColumnType::Link | ColumnType::LinkList)
    }

    pub fn is_list(self) -> bool {
        self == ColumnType::LinkList
    }

    fn from_bits(bits: u8) -> Option<ColumnType> {
        Some(match bits {
            0 => ColumnType::Int,
            1 => ColumnType::Bool,
            2 => ColumnType::String,
            3 => ColumnType::Binary,
            4 => ColumnType::Double,
            5 => ColumnType::Timestamp,
            6 => ColumnType::Link,
            7 => ColumnType::LinkList,
            _ => return None,
        })
    }
}

/// Attribute bits packed into a `ColKey`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnAttrs(pub u8);

impl ColumnAttrs {
    pub const NULLABLE: u8 = 0x01;
    pub const LIST: u8 = 0x02;
    pub const PRIMARY_KEY: u8 = 0x04;

    pub fn nullable(self) -> bool {
        self.0 & Self::NULLABLE != 0
    }

    pub fn list(self) -> bool {
        self.0 & Self::LIST != 0
    }

    pub fn primary_key(self) -> bool {
        self.0 & Self::PRIMARY_KEY != 0
    }
}

impl fmt::Debug for ColumnAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColumnAttrs({:#04x})", self.0)
    }
}

/// Key of one column. Packs `{index:16, type:6, attrs:8, tag:32}` into the low
/// 62 bits, leaving the top bit free like `TableKey`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColKey(pub i64);

impl ColKey {
    pub const NULL: ColKey = ColKey((u64::MAX >> 1) as i64);

    pub fn new(index: u16, ty: ColumnType, attrs: ColumnAttrs, tag: u32) -> ColKey {
        let value = (index as u64 & 0xFFFF)
            | (((ty as u64) & 0x3F) << 16)
            | (((attrs.0 as u64) & 0xFF) << 22)
            | ((tag as u64) << 30);
        ColKey(value as i64)
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn index(self) -> u16 {
        (self.0 as u64 & 0xFFFF) as u16
    }

    pub fn column_type(self) -> Option<ColumnType> {
        ColumnType::from_bits(((self.0 as u64 >> 16) & 0x3F) as u8)
    }

    pub fn attrs(self) -> ColumnAttrs {
        ColumnAttrs(((self.0 as u64 >> 22) & 0xFF) as u8)
    }

    pub fn tag(self) -> u32 {
        ((self.0 as u64 >> 30) & 0xFFFF_FFFF) as u32
    }
}

impl Default for ColKey {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for ColKey {
    fmt_key!("ColKey");
}

/// Key of one object within a table. Null is `-1`; the `UNRESOLVED` bit marks
/// a tombstone standing in for a not-yet-resolved link target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey(pub i64);

impl ObjKey {
    pub const NULL: ObjKey = ObjKey(-1);
    const UNRESOLVED: i64 = 0x4000_0000_0000_0000;

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn is_unresolved(self) -> bool {
        self.0 & Self::UNRESOLVED != 0
    }

    pub fn make_unresolved(self) -> ObjKey {
        ObjKey(self.0 | Self::UNRESOLVED)
    }

    pub fn resolved(self) -> ObjKey {
        ObjKey(self.0 & !Self::UNRESOLVED)
    }
}

impl Default for ObjKey {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for ObjKey {
    fmt_key!("ObjKey");
}

/// Identifies one MVCC snapshot: the commit version plus the reader slot the
/// snapshot is pinned through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId {
    pub version: u64,
    pub reader_slot: u32,
}

impl VersionId {
    pub fn new(version: u64, reader_slot: u32) -> VersionId {
        VersionId {
            version,
            reader_slot,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version, self.reader_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn col_key_packs_and_unpacks_fields() {
        let key = ColKey::new(41, ColumnType::LinkList, ColumnAttrs(ColumnAttrs::LIST), 7);
        assert_eq!(key.index(), 41);
        assert_eq!(key.column_type(), Some(ColumnType::LinkList));
        assert!(key.attrs().list());
        assert!(!key.attrs().nullable());
        assert_eq!(key.tag(), 7);
        assert!(!key.is_null());
    }

    #[test]
    fn col_key_null_is_distinct_from_packed_keys() {
        let key = ColKey::new(0, ColumnType::Int, ColumnAttrs::default(), 0);
        assert!(!key.is_null());
        assert!(ColKey::NULL.is_null());
        assert_ne!(key, ColKey::NULL);
    }

    #[test]
    fn obj_key_unresolved_round_trip() {
        let key = ObjKey(1234);
        let unresolved = key.make_unresolved();
        assert!(unresolved.is_unresolved());
        assert!(!key.is_unresolved());
        assert_eq!(unresolved.resolved(), key);
    }

    #[test]
    fn obj_key_null_is_minus_one() {
        assert_eq!(ObjKey::NULL.0, -1);
        assert!(ObjKey::default().is_null());
    }
}
