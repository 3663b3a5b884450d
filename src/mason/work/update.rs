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

use std::fs;
use std::io;
use std::sync::Mutex;

use console::style;

use crate::driver::Work;
use crate::error::Error;
use crate::graph::{Graph, NodeIndex};
use crate::store::{Flags, NodeId, NodeKind, Store};
use crate::trace::Tracer;
use crate::util::CwdGuard;

use super::command::{self, Target};

/// Execute-phase worker: applies the per-node action (deletion, command
/// execution, variable substitution) and propagates flags back to the
/// store on success.
pub struct UpdateWork<'a, T> {
    store: &'a dyn Store,
    tracer: &'a mut T,
}

impl<'a, T: Tracer> UpdateWork<'a, T> {
    pub fn new(store: &'a dyn Store, tracer: &'a mut T) -> UpdateWork<'a, T> {
        UpdateWork { store, tracer }
    }

    fn apply(&mut self, target: &Target) -> Result<(), Error> {
        let deleting = target.flags.contains(Flags::DELETE);

        match target.kind {
            NodeKind::File if deleting => {
                self.echo_delete(target);
                self.delete_file(target)
            }
            NodeKind::Dir | NodeKind::Var if deleting => {
                self.echo_delete(target);
                self.store.delete_node(target.id)
            }
            NodeKind::Command if deleting => {
                self.echo_delete(target);
                self.store.delete_node(target.id)
            }
            NodeKind::Command => {
                command::run(self.store, &mut *self.tracer, target)
            }
            _ => Ok(()),
        }
    }

    fn echo_delete(&self, target: &Target) {
        println!(
            "{}",
            style(format!("Delete[{}]: {}", target.id, target.name))
                .magenta()
        );
    }

    /// Unlinks the node's backing file relative to its parent directory
    /// and deletes the node row. A vanished directory or an already-gone
    /// file is not an error.
    fn delete_file(&self, target: &Target) -> Result<(), Error> {
        self.store.delete_node(target.id)?;

        let dir = match self.store.open_node_dir(target.dir)? {
            Some(dir) => dir,
            // If the directory doesn't exist, the file can't either.
            None => return Ok(()),
        };
        let _cwd = CwdGuard::enter(&dir)?;

        match fs::remove_file(&target.name) {
            Ok(()) => Ok(()),
            // Don't care if the file is already gone.
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::from(err)
                .context(format!("failed deleting '{}'", target.name))
                .into()),
        }
    }
}

impl<'a, T: Tracer> Work for UpdateWork<'a, T> {
    fn run(
        &mut self,
        graph: &Mutex<Graph>,
        node: NodeIndex,
    ) -> Result<(), Error> {
        let (target, successors) = {
            let g = graph.lock().unwrap();
            let n = g.node(node);
            let target = Target {
                id: n.id,
                dir: n.dir,
                kind: n.kind,
                flags: n.flags,
                name: n.name.clone(),
            };
            let successors: Vec<NodeId> =
                n.edges().iter().map(|&dest| g.node(dest).id).collect();
            (target, successors)
        };

        self.apply(&target)?;

        // Mark the next nodes as modified first, so a run that dies
        // partway through resumes there.
        for id in successors {
            self.store.add_modify(id)?;
        }
        self.store.set_flags(target.id, Flags::empty())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use tempfile::tempdir;

    use crate::db::Database;
    use crate::trace::NullTracer;
    use crate::util::testing::cwd_lock;

    fn run_one(
        db: &Database,
        id: NodeId,
    ) -> Result<(), Error> {
        let mut graph = Graph::new(NodeKind::Command);
        let index = graph.create_node(&db.node(id).unwrap());
        let graph = Mutex::new(graph);

        let mut tracer = NullTracer::default();
        let mut work = UpdateWork::new(db, &mut tracer);
        work.run(&graph, index)
    }

    #[test]
    fn test_delete_file_unlinks_and_drops_the_row() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        fs::write(dir.path().join("stale.o"), "junk").unwrap();
        let id = db.create_node(0, "stale.o", NodeKind::File).unwrap();
        db.set_flags(id, Flags::DELETE).unwrap();

        run_one(&db, id).unwrap();

        assert!(!dir.path().join("stale.o").exists());
        assert!(db.node(id).is_none());
    }

    #[test]
    fn test_delete_file_tolerates_a_missing_file() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let id = db.create_node(0, "never-built.o", NodeKind::File).unwrap();
        db.set_flags(id, Flags::DELETE).unwrap();

        run_one(&db, id).unwrap();
        assert!(db.node(id).is_none());
    }

    #[test]
    fn test_delete_file_tolerates_a_missing_directory() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let sub = db.create_node(0, "gone", NodeKind::Dir).unwrap();
        let id = db.create_node(sub, "stale.o", NodeKind::File).unwrap();
        db.set_flags(id, Flags::DELETE).unwrap();

        run_one(&db, id).unwrap();
        assert!(db.node(id).is_none());
    }

    #[test]
    fn test_delete_dir_and_var_rows() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let d = db.create_node(0, "old-dir", NodeKind::Dir).unwrap();
        db.set_flags(d, Flags::DELETE).unwrap();
        run_one(&db, d).unwrap();
        assert!(db.node(d).is_none());

        let v = db.set_var("OLD", "x").unwrap();
        db.set_flags(v, Flags::DELETE).unwrap();
        run_one(&db, v).unwrap();
        assert!(db.node(v).is_none());
    }

    #[test]
    fn test_delete_command_row() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let id = db.create_node(0, "false", NodeKind::Command).unwrap();
        db.set_flags(id, Flags::DELETE).unwrap();

        // The command is deleted, not run, so "false" never executes.
        run_one(&db, id).unwrap();
        assert!(db.node(id).is_none());
    }

    #[test]
    fn test_unflagged_files_are_noops() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        fs::write(dir.path().join("source.c"), "int main;").unwrap();
        let id = db.create_node(0, "source.c", NodeKind::File).unwrap();
        db.set_flags(id, Flags::MODIFY).unwrap();

        run_one(&db, id).unwrap();

        // The file survives; the flags are reset.
        assert!(dir.path().join("source.c").exists());
        assert_eq!(db.node(id).unwrap().flags, Flags::empty());
    }

    #[test]
    fn test_success_propagates_modify_to_successors() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let a = db.create_node(0, "true", NodeKind::Command).unwrap();
        let b = db.create_node(0, "downstream", NodeKind::Command).unwrap();
        db.set_flags(a, Flags::MODIFY).unwrap();

        let mut graph = Graph::new(NodeKind::Command);
        let ai = graph.create_node(&db.node(a).unwrap());
        let bi = graph.create_node(&db.node(b).unwrap());
        graph.create_edge(ai, bi);
        let graph = Mutex::new(graph);

        let mut tracer = NullTracer::default();
        let mut work = UpdateWork::new(&db, &mut tracer);
        work.run(&graph, ai).unwrap();

        // The successor is queued for a future run and the command's own
        // flags are gone (on its dup row; the old row was replaced).
        assert!(db.node(b).unwrap().flags.contains(Flags::MODIFY));
        assert!(db.node(a).is_none());
        let dup = db.lookup_node(0, "true").unwrap().unwrap();
        assert_eq!(dup.flags, Flags::empty());
    }
}
