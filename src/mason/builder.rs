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

//! Working-graph construction.
//!
//! Seeds are drawn from the store with flag-filtered queries and attached
//! under the synthetic root. A stack-driven depth-first traversal then pulls
//! each node's dependencies out of the store. Nodes go through three states
//! on the same stack (`Initialized` -> `Processing` -> `Finished`); an edge
//! to a node still in `Processing` is a back-edge onto the traversal stack
//! and therefore a cycle, which is fatal for the phase.
//!
//! When the traversal encounters an edge to a node that is present but not
//! yet visited, the node is moved to the head of the stack so the traversal
//! descends into it. This keeps cycle detection complete even when every
//! member of the cycle was seeded directly.

use failure::Fail;
use log::debug;

use crate::error::Error;
use crate::graph::{Graph, NodeState};
use crate::store::{Flags, NodeId, NodeKind, NodeRecord, Store};

/// A back-edge onto the construction stack.
#[derive(Debug, Fail, Eq, PartialEq)]
#[fail(
    display = "Circular dependency detected! Last edge was: {} -> {}",
    src, dest
)]
pub struct CircularDependency {
    pub src: NodeId,
    pub dest: NodeId,
}

/// Builds the working graph for one phase: installs every node matching the
/// seed flags under the synthetic root, then resolves transitive
/// dependencies. On success the pending list holds every reachable node in
/// post-order.
pub fn build(
    store: &dyn Store,
    pivot: NodeKind,
    seeds: &[Flags],
) -> Result<Graph, Error> {
    let mut graph = Graph::new(pivot);

    for &flag in seeds {
        store.select_nodes_by_flags(flag, &mut |record| {
            install(&mut graph, record)
        })?;
    }

    resolve(store, &mut graph)?;

    Ok(graph)
}

/// Installer callback: find or create the node for `record` and attach an
/// edge from the node currently being resolved.
fn install(graph: &mut Graph, record: &NodeRecord) -> Result<(), Error> {
    let index = match graph.find_node(record.id) {
        Some(index) => index,
        None => graph.create_node(record),
    };

    if graph.node(index).state() == NodeState::Processing {
        return Err(CircularDependency {
            src: graph.node(graph.cur()).id,
            dest: record.id,
        }
        .into());
    }

    graph.create_edge(graph.cur(), index);

    // Descend into nodes that have not been visited yet.
    if graph.node(index).state() == NodeState::Initialized {
        graph.move_to_front(index);
    }

    Ok(())
}

fn resolve(store: &dyn Store, graph: &mut Graph) -> Result<(), Error> {
    while let Some(cur) = graph.ready_front() {
        let state = graph.node(cur).state();
        match state {
            NodeState::Initialized => {
                let id = graph.node(cur).id;
                debug!("find deps for node: {}", id);

                // Processing is set before the query so a self-edge is
                // caught as a cycle.
                graph.begin_visit(cur);

                store.select_links_by_source(id, &mut |record| {
                    install(&mut *graph, record)
                })?;
            }
            NodeState::Processing => {
                debug!("remove node from stack: {}", graph.node(cur).id);
                graph.park(cur);
            }
            NodeState::Finished => {
                unreachable!("finished node on the construction stack")
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::graph::NodeState;

    fn command(db: &Database, name: &str, flags: Flags) -> NodeId {
        let id = db.create_node(0, name, NodeKind::Command).unwrap();
        db.set_flags(id, flags).unwrap();
        id
    }

    #[test]
    fn test_post_order() {
        let db = Database::in_memory(".");
        let a = command(&db, "a", Flags::MODIFY);
        let b = command(&db, "b", Flags::MODIFY);
        let c = command(&db, "c", Flags::MODIFY);
        db.create_link(a, b).unwrap();
        db.create_link(b, c).unwrap();

        let graph =
            build(&db, NodeKind::Command, &[Flags::MODIFY]).unwrap();

        // Leaves finish first; the synthetic root was installed before any
        // of them.
        assert_eq!(graph.pending_ids(), vec![0, c, b, a]);
        assert!(graph.ready_ids().is_empty());
        assert_eq!(graph.num_nodes(), 3);

        for id in &[a, b, c] {
            let index = graph.find_node(*id).unwrap();
            assert_eq!(graph.node(index).state(), NodeState::Finished);
        }
    }

    #[test]
    fn test_transitive_dependencies_are_pulled_in() {
        let db = Database::in_memory(".");
        let a = command(&db, "a", Flags::MODIFY);
        let b = command(&db, "b", Flags::empty());
        let c = command(&db, "c", Flags::empty());
        db.create_link(a, b).unwrap();
        db.create_link(b, c).unwrap();

        let graph =
            build(&db, NodeKind::Command, &[Flags::MODIFY]).unwrap();

        assert!(graph.find_node(b).is_some());
        assert!(graph.find_node(c).is_some());
        assert_eq!(graph.num_nodes(), 3);
    }

    #[test]
    fn test_union_of_seed_queries() {
        let db = Database::in_memory(".");
        let a = command(&db, "a", Flags::MODIFY);
        let b = command(&db, "b", Flags::DELETE);
        let both = command(&db, "both", Flags::MODIFY | Flags::DELETE);

        let graph =
            build(&db, NodeKind::Command, &[Flags::MODIFY, Flags::DELETE])
                .unwrap();

        assert!(graph.find_node(a).is_some());
        assert!(graph.find_node(b).is_some());
        assert!(graph.find_node(both).is_some());
        // DELETE-flagged commands are excluded from the progress total.
        assert_eq!(graph.num_nodes(), 1);
    }

    #[test]
    fn test_cycle_between_seeded_dirs() {
        let db = Database::in_memory(".");
        let y = db.create_node(0, "Y", NodeKind::Dir).unwrap();
        let x = db.create_node(0, "X", NodeKind::Dir).unwrap();
        db.set_flags(y, Flags::CREATE).unwrap();
        db.set_flags(x, Flags::CREATE).unwrap();
        db.create_link(x, y).unwrap();
        db.create_link(y, x).unwrap();

        let err =
            build(&db, NodeKind::Dir, &[Flags::CREATE]).unwrap_err();

        assert_eq!(
            format!("{}", err),
            format!(
                "Circular dependency detected! Last edge was: {} -> {}",
                y, x
            )
        );
        assert!(err.downcast_ref::<CircularDependency>().is_some());
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let db = Database::in_memory(".");
        let a = command(&db, "a", Flags::MODIFY);
        db.create_link(a, a).unwrap();

        let err =
            build(&db, NodeKind::Command, &[Flags::MODIFY]).unwrap_err();

        let cycle = err.downcast_ref::<CircularDependency>().unwrap();
        assert_eq!((cycle.src, cycle.dest), (a, a));
    }

    #[test]
    fn test_empty_seed_set() {
        let db = Database::in_memory(".");
        let graph =
            build(&db, NodeKind::Dir, &[Flags::CREATE]).unwrap();
        assert_eq!(graph.num_nodes(), 0);
        assert_eq!(graph.pending_ids(), vec![0]);
    }
}
