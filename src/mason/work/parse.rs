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

use std::sync::Mutex;

use log::debug;

use crate::driver::Work;
use crate::error::Error;
use crate::graph::{Graph, NodeIndex};
use crate::rules::Parser;
use crate::store::{NodeKind, Store};

/// Parse-phase worker: refreshes each directory node from its build
/// description. Files, variables, and commands in the create graph are
/// no-ops. The CREATE flag is cleared for every node, parsed or not.
pub struct ParseWork<'a> {
    store: &'a dyn Store,
    parser: &'a dyn Parser,
}

impl<'a> ParseWork<'a> {
    pub fn new(
        store: &'a dyn Store,
        parser: &'a dyn Parser,
    ) -> ParseWork<'a> {
        ParseWork { store, parser }
    }
}

impl<'a> Work for ParseWork<'a> {
    fn run(
        &mut self,
        graph: &Mutex<Graph>,
        node: NodeIndex,
    ) -> Result<(), Error> {
        let mut g = graph.lock().unwrap();

        let (id, kind, parsed) = {
            let n = g.node(node);
            (n.id, n.kind, n.parsed)
        };

        let result = match kind {
            NodeKind::Dir if parsed => {
                // Already ran this phase; parsing is idempotent.
                debug!("already parsed [{}]: '{}'", id, g.node(node).name);
                Ok(())
            }
            NodeKind::Dir => {
                let result = self.parser.parse(self.store, &mut *g, node);
                if result.is_ok() {
                    g.node_mut(node).parsed = true;
                }
                result
            }
            NodeKind::File | NodeKind::Var | NodeKind::Command => Ok(()),
        };

        drop(g);

        // The flag comes off even when parsing failed, but a failed clear
        // degrades the status.
        let cleared = self.store.clear_create(id);
        result.and(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::Flags;

    /// Counts invocations; stands in for a real description parser.
    struct CountingParser {
        calls: Mutex<usize>,
    }

    impl Parser for CountingParser {
        fn parse(
            &self,
            _store: &dyn Store,
            _graph: &mut Graph,
            _dir: NodeIndex,
        ) -> Result<(), Error> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn dir_graph(db: &Database, name: &str) -> (Graph, NodeIndex, i64) {
        let id = db.create_node(0, name, NodeKind::Dir).unwrap();
        db.set_flags(id, Flags::CREATE).unwrap();
        let mut graph = Graph::new(NodeKind::Dir);
        let index = graph.create_node(&db.node(id).unwrap());
        (graph, index, id)
    }

    #[test]
    fn test_directory_is_parsed_and_unflagged() {
        let db = Database::in_memory(".");
        let (graph, index, id) = dir_graph(&db, "sub");
        let parser = CountingParser {
            calls: Mutex::new(0),
        };

        let graph = Mutex::new(graph);
        let mut work = ParseWork::new(&db, &parser);
        work.run(&graph, index).unwrap();

        assert_eq!(*parser.calls.lock().unwrap(), 1);
        assert_eq!(db.node(id).unwrap().flags, Flags::empty());
        assert!(graph.lock().unwrap().node(index).parsed);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let db = Database::in_memory(".");
        let (graph, index, _) = dir_graph(&db, "sub");
        let parser = CountingParser {
            calls: Mutex::new(0),
        };

        let graph = Mutex::new(graph);
        let mut work = ParseWork::new(&db, &parser);
        work.run(&graph, index).unwrap();
        work.run(&graph, index).unwrap();

        // The second visit is a no-op.
        assert_eq!(*parser.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_non_directories_are_noops() {
        let db = Database::in_memory(".");
        let id = db.create_node(0, "foo.c", NodeKind::File).unwrap();
        db.set_flags(id, Flags::CREATE).unwrap();

        let mut graph = Graph::new(NodeKind::Dir);
        let index = graph.create_node(&db.node(id).unwrap());

        let parser = CountingParser {
            calls: Mutex::new(0),
        };
        let graph = Mutex::new(graph);
        let mut work = ParseWork::new(&db, &parser);
        work.run(&graph, index).unwrap();

        assert_eq!(*parser.calls.lock().unwrap(), 0);
        // The CREATE flag still comes off.
        assert_eq!(db.node(id).unwrap().flags, Flags::empty());
    }
}
