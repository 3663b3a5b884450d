// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The interface to the persistent graph store. The driver and workers only
//! ever talk to the store through the [`Store`] trait; [`crate::db::Database`]
//! is the shipped implementation.

use std::fs;
use std::io;

use bitflags::bitflags;
use derive_more::Display;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::trace::FileInfo;

/// Identifier of a node row in the store. Unique across the store. The id
/// `0` is reserved for the project root directory and never names a row.
pub type NodeId = i64;

bitflags! {
    /// Pending-work flags carried by every node row. An empty set means the
    /// node is up to date.
    pub struct Flags: u8 {
        const CREATE = 0b001;
        const MODIFY = 0b010;
        const DELETE = 0b100;
    }
}

// Flags are persisted as their raw bits.
impl Serialize for Flags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D>(deserializer: D) -> Result<Flags, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = u8::deserialize(deserializer)?;
        Flags::from_bits(bits).ok_or_else(|| {
            de::Error::custom(format!("invalid node flags {:#04x}", bits))
        })
    }
}

/// The type of a build entity.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum NodeKind {
    #[display(fmt = "dir")]
    Dir,
    #[display(fmt = "file")]
    File,
    #[display(fmt = "command")]
    Command,
    #[display(fmt = "var")]
    Var,
}

/// A node row as returned by the store's select queries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Id of the directory node this entity lives in.
    pub dir: NodeId,
    pub kind: NodeKind,
    /// For commands this is the shell command string; for everything else
    /// it is the entity's file name.
    pub name: String,
    pub flags: Flags,
}

/// Callback invoked per row by the select queries. Iteration stops at the
/// first error, which is returned to the caller. The callback must not call
/// back into the store.
pub type NodeCallback<'a> = dyn FnMut(&NodeRecord) -> Result<(), Error> + 'a;

/// The persistent graph store.
///
/// A phase runs inside a single transaction bracket; the store serializes
/// concurrent callers internally (the driver thread and the worker thread
/// both hold a reference during a phase, hence the `Sync` bound).
///
/// Mutations follow SQL `UPDATE`/`DELETE` semantics: operating on a row
/// that no longer exists is not an error. A successful command replaces its
/// own row with a freshly allocated duplicate, so flag propagation on the
/// old id must be a quiet no-op.
pub trait Store: Sync {
    fn begin(&self) -> Result<(), Error>;
    fn commit(&self) -> Result<(), Error>;
    fn rollback(&self) -> Result<(), Error>;

    /// Invokes `cb` for every node with `flag` in its flag set, in id order.
    fn select_nodes_by_flags(
        &self,
        flag: Flags,
        cb: &mut NodeCallback<'_>,
    ) -> Result<(), Error>;

    /// Invokes `cb` for every `dest` such that a link `src -> dest` exists.
    fn select_links_by_source(
        &self,
        src: NodeId,
        cb: &mut NodeCallback<'_>,
    ) -> Result<(), Error>;

    /// Looks up a node by its directory and name.
    fn lookup_node(
        &self,
        dir: NodeId,
        name: &str,
    ) -> Result<Option<NodeRecord>, Error>;

    /// Finds or creates a node row, returning its id. A fresh row starts
    /// with an empty flag set.
    fn create_node(
        &self,
        dir: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, Error>;

    /// Allocates a duplicate node row that will take ownership of a
    /// command's outputs, letting the original row be collected.
    fn create_dup_node(
        &self,
        dir: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, Error>;

    /// Deletes a node row and any links touching it.
    fn delete_node(&self, id: NodeId) -> Result<(), Error>;

    /// Sets MODIFY in the node's flag set.
    fn add_modify(&self, id: NodeId) -> Result<(), Error>;

    /// Overwrites the node's flag set.
    fn set_flags(&self, id: NodeId, flags: Flags) -> Result<(), Error>;

    /// Clears CREATE from the node's flag set.
    fn clear_create(&self, id: NodeId) -> Result<(), Error>;

    /// Records a link `src -> dest`.
    fn create_link(&self, src: NodeId, dest: NodeId) -> Result<(), Error>;

    /// Opens the on-disk directory backing the directory node `id`.
    /// Returns `Ok(None)` when the directory no longer exists.
    fn open_node_dir(&self, id: NodeId) -> Result<Option<fs::File>, Error>;

    /// Writes the named variable's value to `out` and returns the
    /// variable's node id. Fails for undefined variables.
    fn write_var(
        &self,
        name: &str,
        out: &mut dyn io::Write,
    ) -> Result<NodeId, Error>;

    /// Reconciles the file accesses observed while running `cmd`: written
    /// files become nodes owned by the duplicate node `dup`, read files
    /// become dependencies of it.
    fn write_files(
        &self,
        dup: NodeId,
        cmd: &str,
        finfo: &FileInfo,
    ) -> Result<(), Error>;

    /// Retrieves a persisted integer configuration key, or 0 when unset.
    fn config_int(&self, key: &str) -> Result<i64, Error>;
}
