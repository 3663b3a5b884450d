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

//! Topological execution of a constructed working graph.
//!
//! One driver thread and one worker thread communicate over two pipes. The
//! driver publishes the next ready node in a shared handoff slot and writes
//! a single request byte; the worker performs the node's action and writes
//! a 32-bit status back (zero on success, negative on failure). A zero
//! request byte shuts the worker down. Exactly one node is in flight at any
//! time, so the store and the graph observe a strict sequential order equal
//! to the dispatch order.

use std::io::{Read, Write};
use std::sync::Mutex;

use failure::{format_err, Fail};
use log::{debug, error};
use os_pipe::{PipeReader, PipeWriter};

use crate::error::{Error, ResultExt};
use crate::graph::{Graph, NodeIndex};
use crate::progress::Progress;
use crate::store::Flags;

/// The per-node action performed by the worker thread. The graph is shared
/// behind a mutex because the parse action may insert nodes and edges into
/// the live graph.
pub trait Work: Send {
    fn run(
        &mut self,
        graph: &Mutex<Graph>,
        node: NodeIndex,
    ) -> Result<(), Error>;
}

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum DriverError {
    /// Nodes were left behind without an execution error; this indicates a
    /// bug or an unreported cycle.
    #[fail(display = "Graph is not empty after execution")]
    GraphNotEmpty,

    /// Dependents of failed nodes were left behind under keep-going.
    #[fail(
        display = "Remaining nodes skipped due to errors in command execution"
    )]
    NodesSkipped,
}

/// Drains the graph in topological order, handing each ready node to
/// `work` on a dedicated thread.
///
/// With `keep_going` set, a failed node is retired without releasing its
/// successors and the drain continues; otherwise the first failure aborts.
pub fn execute<W: Work>(
    graph: Graph,
    work: W,
    keep_going: bool,
    progress: &mut Progress,
) -> Result<(), Error> {
    let (request_rx, mut request_tx) = os_pipe::pipe()?;
    let (mut status_rx, status_tx) = os_pipe::pipe()?;

    let graph = Mutex::new(graph);
    let slot: Mutex<Option<NodeIndex>> = Mutex::new(None);

    let result = crossbeam::scope(|scope| {
        {
            let graph = &graph;
            let slot = &slot;
            scope.spawn(move |_| {
                work_loop(work, graph, slot, request_rx, status_tx)
            });
        }

        let result = drive(
            &graph,
            &slot,
            &mut request_tx,
            &mut status_rx,
            keep_going,
            progress,
        );

        // Shut the worker down. If it already exited, the write fails and
        // dropping our end of the pipe unblocks it anyway.
        let _ = request_tx.write_all(&[0]);

        result
    });

    match result {
        Ok(result) => result,
        Err(_) => Err(format_err!("worker thread panicked")),
    }
}

fn drive(
    graph: &Mutex<Graph>,
    slot: &Mutex<Option<NodeIndex>>,
    request_tx: &mut PipeWriter,
    status_rx: &mut PipeReader,
    keep_going: bool,
    progress: &mut Progress,
) -> Result<(), Error> {
    {
        // The synthetic root exists only to anchor the seeds. Pop it to
        // release them and retire it.
        let mut g = graph.lock().unwrap();
        let root = g.root();
        g.pop_node(root);
        g.remove_node(root);
        progress.resize(g.num_nodes());
    }

    progress.draw();

    loop {
        let node = {
            let mut g = graph.lock().unwrap();

            let node = match g.ready_front() {
                Some(node) => node,
                None => break,
            };

            debug!(
                "cur node: {} [{}]",
                g.node(node).id,
                g.node(node).incoming()
            );

            if g.node(node).incoming() > 0 {
                // Not all prerequisites have run yet. A later pop_node
                // will put it back on the ready stack.
                g.park(node);
                continue;
            }

            node
        };

        // Publish the node, then wake the worker. The request byte is the
        // happens-before edge for the handoff slot.
        *slot.lock().unwrap() = Some(node);
        request_tx
            .write_all(&[1])
            .context("failed sending work request")?;

        let mut status = [0u8; 4];
        status_rx
            .read_exact(&mut status)
            .context("status channel closed before the node finished")?;
        let status = i32::from_ne_bytes(status);

        let mut g = graph.lock().unwrap();

        if status < 0 && !keep_going {
            let id = g.node(node).id;
            return Err(format_err!("node {} failed", id));
        }

        if status >= 0 {
            g.pop_node(node);
        }

        let (kind, flags) = {
            let n = g.node(node);
            (n.kind, n.flags)
        };
        if kind == g.pivot() && !flags.contains(Flags::DELETE) {
            progress.resize(g.num_nodes());
            progress.tick();
        }

        g.remove_node(node);
    }

    let g = graph.lock().unwrap();
    if !g.is_empty() {
        progress.interrupt();
        if keep_going {
            return Err(DriverError::NodesSkipped.into());
        } else {
            return Err(DriverError::GraphNotEmpty.into());
        }
    }

    Ok(())
}

fn work_loop<W: Work>(
    mut work: W,
    graph: &Mutex<Graph>,
    slot: &Mutex<Option<NodeIndex>>,
    mut request_rx: PipeReader,
    mut status_tx: PipeWriter,
) {
    let mut request = [0u8; 1];

    loop {
        // EOF means the driver went away; treat it like a shutdown byte.
        if request_rx.read_exact(&mut request).is_err() {
            break;
        }
        if request[0] == 0 {
            break;
        }

        let node = match slot.lock().unwrap().take() {
            Some(node) => node,
            None => break,
        };

        let status: i32 = match work.run(graph, node) {
            Ok(()) => 0,
            Err(err) => {
                let mut causes = err.iter_chain();
                if let Some(cause) = causes.next() {
                    error!("{}", cause);
                }
                for cause in causes {
                    error!("caused by: {}", cause);
                }
                -1
            }
        };

        if status_tx.write_all(&status.to_ne_bytes()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::graph::NodeIndex;
    use crate::store::{NodeId, NodeKind, NodeRecord};

    /// Records dispatch order and fails on the configured node ids.
    struct ScriptedWork {
        seen: Arc<Mutex<Vec<NodeId>>>,
        fail: Vec<NodeId>,
    }

    impl Work for ScriptedWork {
        fn run(
            &mut self,
            graph: &Mutex<Graph>,
            node: NodeIndex,
        ) -> Result<(), Error> {
            let id = graph.lock().unwrap().node(node).id;
            self.seen.lock().unwrap().push(id);
            if self.fail.contains(&id) {
                Err(format_err!("scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    fn record(id: NodeId) -> NodeRecord {
        NodeRecord {
            id,
            dir: 0,
            kind: NodeKind::Command,
            name: format!("node{}", id),
            flags: Flags::MODIFY,
        }
    }

    fn seed(graph: &mut Graph, id: NodeId) -> NodeIndex {
        let index = graph.create_node(&record(id));
        let root = graph.root();
        graph.create_edge(root, index);
        index
    }

    fn diamond() -> (Graph, NodeId, NodeId, NodeId, NodeId) {
        let mut graph = Graph::new(NodeKind::Command);
        let a = seed(&mut graph, 1);
        let b = seed(&mut graph, 2);
        let c = seed(&mut graph, 3);
        let d = seed(&mut graph, 4);
        graph.create_edge(a, b);
        graph.create_edge(a, c);
        graph.create_edge(b, d);
        graph.create_edge(c, d);
        (graph, 1, 2, 3, 4)
    }

    fn run(
        graph: Graph,
        fail: Vec<NodeId>,
        keep_going: bool,
    ) -> (Vec<NodeId>, Result<(), Error>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let work = ScriptedWork {
            seen: seen.clone(),
            fail,
        };
        let result =
            execute(graph, work, keep_going, &mut Progress::disabled());
        let seen = seen.lock().unwrap().clone();
        (seen, result)
    }

    #[test]
    fn test_linear_chain_dispatch_order() {
        let mut graph = Graph::new(NodeKind::Command);
        let a = seed(&mut graph, 1);
        let b = seed(&mut graph, 2);
        let c = seed(&mut graph, 3);
        graph.create_edge(a, b);
        graph.create_edge(b, c);

        let (seen, result) = run(graph, vec![], false);
        assert!(result.is_ok());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_diamond_dispatch_order() {
        let (graph, a, b, c, d) = diamond();
        let (seen, result) = run(graph, vec![], false);
        assert!(result.is_ok());
        // The source is first, the sink last, and the middle pair runs in
        // seed order.
        assert_eq!(seen, vec![a, b, c, d]);
    }

    #[test]
    fn test_each_node_dispatched_once() {
        let (graph, ..) = diamond();
        let (seen, _) = run(graph, vec![], false);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seen.len());
    }

    #[test]
    fn test_failure_stops_dispatch() {
        let mut graph = Graph::new(NodeKind::Command);
        let a = seed(&mut graph, 1);
        let b = seed(&mut graph, 2);
        let c = seed(&mut graph, 3);
        graph.create_edge(a, b);
        graph.create_edge(b, c);

        let (seen, result) = run(graph, vec![2], false);
        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_keep_going_blocks_dependents_of_failures() {
        let (graph, a, b, c, d) = diamond();

        // C fails: A and B still run, D stays blocked behind C's
        // unreleased edge.
        let (seen, result) = run(graph, vec![c], true);
        assert_eq!(seen, vec![a, b, c]);
        assert!(!seen.contains(&d));

        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DriverError>(),
            Some(&DriverError::NodesSkipped)
        );
    }

    #[test]
    fn test_keep_going_still_runs_independent_nodes() {
        let mut graph = Graph::new(NodeKind::Command);
        let a = seed(&mut graph, 1);
        let b = seed(&mut graph, 2);
        seed(&mut graph, 3);
        graph.create_edge(a, b);

        // A fails; B is blocked but the independent node 3 still runs.
        let (seen, result) = run(graph, vec![1], true);
        assert_eq!(seen, vec![1, 3]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::new(NodeKind::Command);
        let (seen, result) = run(graph, vec![], false);
        assert!(result.is_ok());
        assert!(seen.is_empty());
    }

    #[test]
    fn test_unresolvable_graph_is_reported() {
        let mut graph = Graph::new(NodeKind::Command);
        let a = seed(&mut graph, 1);
        let b = seed(&mut graph, 2);
        // A cycle that slipped past construction never becomes ready.
        graph.create_edge(a, b);
        graph.create_edge(b, a);

        let (seen, result) = run(graph, vec![], false);
        assert!(seen.is_empty());
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DriverError>(),
            Some(&DriverError::GraphNotEmpty)
        );
    }
}
