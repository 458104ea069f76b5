// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The operational-transform instruction stream.
//!
//! A `Changeset` is the ordered list of instructions one transaction applied,
//! encoded canonically with `bcs`. The same encoding is stored in the local
//! history, carried in DOWNLOAD/UPLOAD bodies, and replayed through
//! transaction-log observers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sync_types::{ColKey, FileIdent, ObjKey, TableKey, Timestamp, Version};

use crate::error::{CoreError, CoreResult};

/// One cell value. A deliberately small subset of a full dynamic value model;
/// links are the only type the change-tracking machinery inspects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Timestamp(u64),
    Link(ObjKey),
}

impl Value {
    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Value::Link(key) => Some(*key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    AddTable {
        table: TableKey,
        name: String,
    },
    EraseTable {
        table: TableKey,
    },
    RenameTable {
        table: TableKey,
        name: String,
    },
    AddColumn {
        table: TableKey,
        col: ColKey,
        name: String,
        target: Option<TableKey>,
    },
    EraseColumn {
        table: TableKey,
        col: ColKey,
    },
    RenameColumn {
        table: TableKey,
        col: ColKey,
        name: String,
    },
    CreateObject {
        table: TableKey,
        obj: ObjKey,
    },
    EraseObject {
        table: TableKey,
        obj: ObjKey,
    },
    ClearTable {
        table: TableKey,
        old_size: u64,
    },
    Set {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        value: Value,
    },
    ListSet {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: u64,
        value: Value,
    },
    ListInsert {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: u64,
        value: Value,
    },
    ListErase {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        index: u64,
    },
    ListMove {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        from: u64,
        to: u64,
    },
    ListSwap {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        a: u64,
        b: u64,
    },
    ListClear {
        table: TableKey,
        obj: ObjKey,
        col: ColKey,
        old_size: u64,
    },
}

impl Instruction {
    pub fn table(&self) -> TableKey {
        match *self {
            Instruction::AddTable { table, .. }
            | Instruction::EraseTable { table }
            | Instruction::RenameTable { table, .. }
            | Instruction::AddColumn { table, .. }
            | Instruction::EraseColumn { table, .. }
            | Instruction::RenameColumn { table, .. }
            | Instruction::CreateObject { table, .. }
            | Instruction::EraseObject { table, .. }
            | Instruction::ClearTable { table, .. }
            | Instruction::Set { table, .. }
            | Instruction::ListSet { table, .. }
            | Instruction::ListInsert { table, .. }
            | Instruction::ListErase { table, .. }
            | Instruction::ListMove { table, .. }
            | Instruction::ListSwap { table, .. }
            | Instruction::ListClear { table, .. } => table,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub instructions: Vec<Instruction>,
}

impl Changeset {
    pub fn new(instructions: Vec<Instruction>) -> Changeset {
        Changeset { instructions }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        bcs::to_bytes(self).expect("changeset serialization cannot fail")
    }

    pub fn decode(data: &[u8]) -> CoreResult<Changeset> {
        bcs::from_bytes(data).map_err(|e| CoreError::ChangesetEncoding(e.to_string()))
    }
}

/// A changeset received from the server, together with its history position.
/// `data` borrows from the owned body buffer of the message that carried it,
/// so the slices stay valid for as long as any store holds on to them.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteChangeset {
    /// The server version produced by this changeset on the server.
    pub remote_version: Version,
    /// The client version the server had integrated when producing it.
    pub last_integrated_local_version: Version,
    pub data: Bytes,
    pub origin_timestamp: Timestamp,
    /// Zero for changesets of server origin.
    pub origin_file_ident: FileIdent,
    /// Size before the server recompacted the changeset, for progress math.
    pub original_changeset_size: u64,
}

impl RemoteChangeset {
    pub fn parse(&self) -> CoreResult<Changeset> {
        Changeset::decode(&self.data)
    }
}
