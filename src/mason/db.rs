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

//! The shipped [`Store`] implementation.
//!
//! Everything lives in four tables: node rows keyed by id, a set of
//! directed links, the variable table, and integer configuration keys. The
//! whole store is serialized with bincode behind a version prefix and
//! committed atomically through a temporary file, so a killed build never
//! leaves a half-written database. A version mismatch discards the stored
//! state and starts over, which simply forces a full rebuild.
//!
//! Transactions are snapshot-based: `begin` clones the tables, `rollback`
//! restores the clone, `commit` drops it and persists. A mutex serializes
//! the driver and worker threads, which both hold a reference during a
//! phase.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use failure::format_err;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, ResultExt};
use crate::store::{
    Flags, NodeCallback, NodeId, NodeKind, NodeRecord, Store,
};
use crate::trace::FileInfo;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VarEntry {
    id: NodeId,
    value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
    links: BTreeSet<(NodeId, NodeId)>,
    vars: BTreeMap<String, VarEntry>,
    config: BTreeMap<String, i64>,
}

impl Tables {
    fn fresh() -> Tables {
        let mut tables = Tables::default();
        tables.config.insert("show_progress".into(), 1);
        tables.config.insert("keep_going".into(), 0);
        tables
    }

    /// A fresh store with the project root directory row seeded for
    /// parsing, so the first run of a new database parses the root build
    /// description.
    fn bootstrapped() -> Tables {
        let mut tables = Tables::fresh();
        let id = tables.insert_node(0, ".", NodeKind::Dir);
        if let Some(record) = tables.nodes.get_mut(&id) {
            record.flags = Flags::CREATE;
        }
        tables
    }

    fn alloc_id(&mut self) -> NodeId {
        self.next_id += 1;
        self.next_id
    }

    fn find(&self, dir: NodeId, name: &str) -> Option<&NodeRecord> {
        self.nodes
            .values()
            .find(|record| record.dir == dir && record.name == name)
    }

    fn insert_node(
        &mut self,
        dir: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            NodeRecord {
                id,
                dir,
                kind,
                name: name.to_string(),
                flags: Flags::empty(),
            },
        );
        id
    }
}

struct State {
    tables: Tables,
    snapshot: Option<Tables>,
}

pub struct Database {
    /// On-disk project root; directory nodes resolve beneath it.
    root: PathBuf,
    /// Persistence location. `None` keeps the store memory-only.
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl Database {
    /// Opens the database at `path`, rooted at the project directory
    /// `root`. A missing file or a version mismatch starts a fresh store
    /// with the root directory queued for parsing.
    pub fn open<P, Q>(root: P, path: Q) -> Result<Database, Error>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();

        let tables = match fs::File::open(&path) {
            Ok(f) => {
                Self::read_tables(io::BufReader::new(f)).with_context(
                    |_| {
                        format!(
                            "failed loading build database from {:?}",
                            path
                        )
                    },
                )?
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                Tables::bootstrapped()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Database {
            root: root.as_ref().to_path_buf(),
            path: Some(path),
            state: Mutex::new(State {
                tables,
                snapshot: None,
            }),
        })
    }

    /// A memory-only database rooted at `root`; commits do not persist.
    pub fn in_memory<P: AsRef<Path>>(root: P) -> Database {
        Database {
            root: root.as_ref().to_path_buf(),
            path: None,
            state: Mutex::new(State {
                tables: Tables::fresh(),
                snapshot: None,
            }),
        }
    }

    fn read_tables<R: io::Read>(
        mut reader: R,
    ) -> Result<Tables, bincode::Error> {
        let version: String = bincode::deserialize_from(&mut reader)?;

        if version != env!("CARGO_PKG_VERSION") {
            // A version bump invalidates the stored graph; start over and
            // force a full rebuild.
            Ok(Tables::bootstrapped())
        } else {
            bincode::deserialize_from(reader)
        }
    }

    fn write_tables(&self, tables: &Tables) -> Result<(), Error> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tempfile = NamedTempFile::new_in(dir)?;

        {
            let mut writer = io::BufWriter::new(&mut tempfile);
            bincode::serialize_into(
                &mut writer,
                env!("CARGO_PKG_VERSION"),
            )?;
            bincode::serialize_into(&mut writer, tables)?;
            io::Write::flush(&mut writer)?;
        }

        tempfile.persist(path).with_context(|_| {
            format!("failed writing build database to {:?}", path)
        })?;

        Ok(())
    }

    /// Defines (or redefines) a variable, returning its node id.
    pub fn set_var(&self, name: &str, value: &str) -> Result<NodeId, Error> {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.tables.vars.get_mut(name) {
            entry.value = value.to_string();
            return Ok(entry.id);
        }

        let id = state.tables.insert_node(0, name, NodeKind::Var);
        state.tables.vars.insert(
            name.to_string(),
            VarEntry {
                id,
                value: value.to_string(),
            },
        );
        Ok(id)
    }

    pub fn set_config(&self, key: &str, value: i64) {
        let mut state = self.state.lock().unwrap();
        state.tables.config.insert(key.to_string(), value);
    }

    /// Fetches a node row by id, if it still exists.
    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        let state = self.state.lock().unwrap();
        state.tables.nodes.get(&id).cloned()
    }

    pub fn has_link(&self, src: NodeId, dest: NodeId) -> bool {
        let state = self.state.lock().unwrap();
        state.tables.links.contains(&(src, dest))
    }

    pub fn node_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.tables.nodes.len()
    }
}

impl Store for Database {
    fn begin(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.snapshot.is_some() {
            return Err(format_err!("transaction already in progress"));
        }
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.snapshot.take().is_none() {
            return Err(format_err!("no transaction in progress"));
        }
        self.write_tables(&state.tables)
    }

    fn rollback(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.snapshot.take() {
            Some(tables) => {
                state.tables = tables;
                Ok(())
            }
            None => Err(format_err!("no transaction in progress")),
        }
    }

    fn select_nodes_by_flags(
        &self,
        flag: Flags,
        cb: &mut NodeCallback<'_>,
    ) -> Result<(), Error> {
        let matches: Vec<NodeRecord> = {
            let state = self.state.lock().unwrap();
            state
                .tables
                .nodes
                .values()
                .filter(|record| record.flags.contains(flag))
                .cloned()
                .collect()
        };

        for record in &matches {
            cb(record)?;
        }
        Ok(())
    }

    fn select_links_by_source(
        &self,
        src: NodeId,
        cb: &mut NodeCallback<'_>,
    ) -> Result<(), Error> {
        let matches: Vec<NodeRecord> = {
            let state = self.state.lock().unwrap();
            state
                .tables
                .links
                .iter()
                .filter(|link| link.0 == src)
                .filter_map(|link| state.tables.nodes.get(&link.1))
                .cloned()
                .collect()
        };

        for record in &matches {
            cb(record)?;
        }
        Ok(())
    }

    fn lookup_node(
        &self,
        dir: NodeId,
        name: &str,
    ) -> Result<Option<NodeRecord>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.tables.find(dir, name).cloned())
    }

    fn create_node(
        &self,
        dir: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, Error> {
        let mut state = self.state.lock().unwrap();

        let existing = state.tables.find(dir, name).map(|record| record.id);
        match existing {
            Some(id) => Ok(id),
            None => Ok(state.tables.insert_node(dir, name, kind)),
        }
    }

    fn create_dup_node(
        &self,
        dir: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> Result<NodeId, Error> {
        // Always a fresh row; the duplicate takes ownership of the
        // command's outputs so the original can be collected.
        let mut state = self.state.lock().unwrap();
        Ok(state.tables.insert_node(dir, name, kind))
    }

    fn delete_node(&self, id: NodeId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.tables.nodes.remove(&id);
        state
            .tables
            .links
            .retain(|&(src, dest)| src != id && dest != id);
        state.tables.vars.retain(|_, entry| entry.id != id);
        Ok(())
    }

    fn add_modify(&self, id: NodeId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.tables.nodes.get_mut(&id) {
            record.flags.insert(Flags::MODIFY);
        }
        Ok(())
    }

    fn set_flags(&self, id: NodeId, flags: Flags) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.tables.nodes.get_mut(&id) {
            record.flags = flags;
        }
        Ok(())
    }

    fn clear_create(&self, id: NodeId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.tables.nodes.get_mut(&id) {
            record.flags.remove(Flags::CREATE);
        }
        Ok(())
    }

    fn create_link(&self, src: NodeId, dest: NodeId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if !state.tables.nodes.contains_key(&src) {
            return Err(format_err!("link source {} does not exist", src));
        }
        if !state.tables.nodes.contains_key(&dest) {
            return Err(format_err!(
                "link destination {} does not exist",
                dest
            ));
        }

        state.tables.links.insert((src, dest));
        Ok(())
    }

    fn open_node_dir(&self, id: NodeId) -> Result<Option<fs::File>, Error> {
        let path = {
            let state = self.state.lock().unwrap();
            node_path(&self.root, &state.tables, id)?
        };

        match fs::File::open(&path) {
            Ok(f) => Ok(Some(f)),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_var(
        &self,
        name: &str,
        out: &mut dyn io::Write,
    ) -> Result<NodeId, Error> {
        let entry = {
            let state = self.state.lock().unwrap();
            state.tables.vars.get(name).cloned()
        };

        let entry = entry
            .ok_or_else(|| format_err!("undefined variable '@{}@'", name))?;

        out.write_all(entry.value.as_bytes())?;
        Ok(entry.id)
    }

    fn write_files(
        &self,
        dup: NodeId,
        cmd: &str,
        finfo: &FileInfo,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        let dir = state
            .tables
            .nodes
            .get(&dup)
            .map(|record| record.dir)
            .ok_or_else(|| {
                format_err!("no duplicate node {} for command '{}'", dup, cmd)
            })?;

        for path in &finfo.writes {
            let name = path.to_string_lossy().into_owned();
            let existing =
                state.tables.find(dir, &name).map(|record| record.id);
            let id = match existing {
                Some(id) => id,
                None => state.tables.insert_node(dir, &name, NodeKind::File),
            };
            state.tables.links.insert((dup, id));
        }

        for path in &finfo.reads {
            let name = path.to_string_lossy().into_owned();
            let existing =
                state.tables.find(dir, &name).map(|record| record.id);
            let id = match existing {
                Some(id) => id,
                None => state.tables.insert_node(dir, &name, NodeKind::File),
            };
            state.tables.links.insert((id, dup));
        }

        Ok(())
    }

    fn config_int(&self, key: &str) -> Result<i64, Error> {
        let state = self.state.lock().unwrap();
        Ok(*state.tables.config.get(key).unwrap_or(&0))
    }
}

/// Resolves a directory node to its on-disk path by walking parent ids up
/// to the project root. Id 0 is the root itself.
fn node_path(
    root: &Path,
    tables: &Tables,
    id: NodeId,
) -> Result<PathBuf, Error> {
    let mut parts = Vec::new();
    let mut cur = id;

    while cur != 0 {
        let record = tables
            .nodes
            .get(&cur)
            .ok_or_else(|| format_err!("no such node {}", cur))?;
        parts.push(record.name.clone());
        cur = record.dir;

        if parts.len() > 1024 {
            return Err(format_err!(
                "directory chain too deep for node {}",
                id
            ));
        }
    }

    let mut path = root.to_path_buf();
    for part in parts.iter().rev() {
        path.push(part);
    }
    Ok(path)
}
