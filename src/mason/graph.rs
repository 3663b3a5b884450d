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

//! The in-memory working graph built for a single phase.
//!
//! The graph owns its nodes in an arena indexed by [`NodeIndex`], so edges
//! carry indices rather than pointers. Every node is on exactly one of two
//! ordered lists: the *ready* stack (nodes being visited during
//! construction, or ready to execute) and the *pending* list (finished, or
//! awaiting prerequisites). A synthetic root node of the phase's pivot kind
//! anchors the seed scan; it is not visible through id lookup and is popped
//! before execution starts.

use std::collections::{HashMap, VecDeque};
use std::mem;

use log::debug;

use crate::store::{Flags, NodeId, NodeKind, NodeRecord};

/// Index of a node slot in the graph's arena. Indices stay valid until the
/// node is retired.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeIndex(usize);

/// Construction state of a node. `Processing` doubles as the "on the DFS
/// stack" bit; an edge to a `Processing` node during construction is a
/// cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    Initialized,
    Processing,
    Finished,
}

/// Which of the two graph lists a node currently sits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NodeList {
    Ready,
    Pending,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub dir: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub flags: Flags,
    /// Whether this directory's build description already ran this phase.
    pub parsed: bool,
    state: NodeState,
    list: NodeList,
    edges: Vec<NodeIndex>,
    incoming: usize,
}

impl Node {
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Number of unreleased edges pointing at this node.
    pub fn incoming(&self) -> usize {
        self.incoming
    }

    /// Outgoing edges, in creation order.
    pub fn edges(&self) -> &[NodeIndex] {
        &self.edges
    }
}

#[derive(Debug)]
pub struct Graph {
    slots: Vec<Option<Node>>,
    ids: HashMap<NodeId, NodeIndex>,
    ready: VecDeque<NodeIndex>,
    pending: VecDeque<NodeIndex>,
    pivot: NodeKind,
    cur: NodeIndex,
    root: NodeIndex,
    num_nodes: usize,
}

impl Graph {
    /// Creates an empty graph with the synthetic root installed on the
    /// pending list. `pivot` is the node kind whose completions advance
    /// progress.
    pub fn new(pivot: NodeKind) -> Graph {
        let root = Node {
            id: 0,
            dir: 0,
            kind: pivot,
            name: String::new(),
            flags: Flags::empty(),
            parsed: false,
            state: NodeState::Finished,
            list: NodeList::Pending,
            edges: Vec::new(),
            incoming: 0,
        };

        let root_index = NodeIndex(0);
        let mut pending = VecDeque::new();
        pending.push_back(root_index);

        Graph {
            slots: vec![Some(root)],
            ids: HashMap::new(),
            ready: VecDeque::new(),
            pending,
            pivot,
            cur: root_index,
            root: root_index,
            num_nodes: 0,
        }
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn pivot(&self) -> NodeKind {
        self.pivot
    }

    /// Number of pivot-kind nodes added so far, excluding ones slated for
    /// deletion and the synthetic root. This is the progress total.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// The node whose dependencies are currently being resolved.
    pub fn cur(&self) -> NodeIndex {
        self.cur
    }

    /// Looks a node up by its store id. The synthetic root is not visible
    /// here.
    pub fn find_node(&self, id: NodeId) -> Option<NodeIndex> {
        self.ids.get(&id).copied()
    }

    /// Returns the node at `index`. Panics if the node has been retired.
    pub fn node(&self, index: NodeIndex) -> &Node {
        self.slots[index.0].as_ref().unwrap()
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        self.slots[index.0].as_mut().unwrap()
    }

    /// Inserts a new node from a store record. The node starts on the ready
    /// stack in `Initialized` state with no edges.
    pub fn create_node(&mut self, record: &NodeRecord) -> NodeIndex {
        let index = NodeIndex(self.slots.len());

        self.slots.push(Some(Node {
            id: record.id,
            dir: record.dir,
            kind: record.kind,
            name: record.name.clone(),
            flags: record.flags,
            parsed: false,
            state: NodeState::Initialized,
            list: NodeList::Ready,
            edges: Vec::new(),
            incoming: 0,
        }));

        self.ids.insert(record.id, index);
        self.ready.push_front(index);

        if record.kind == self.pivot && !record.flags.contains(Flags::DELETE)
        {
            self.num_nodes += 1;
        }

        debug!("create node: {} ({})", record.id, record.kind);

        index
    }

    /// Records an edge `src -> dest`, bumping the destination's incoming
    /// count. Duplicate edges between the same pair are ignored.
    pub fn create_edge(&mut self, src: NodeIndex, dest: NodeIndex) {
        if self.node(src).edges.contains(&dest) {
            return;
        }

        self.node_mut(src).edges.push(dest);
        self.node_mut(dest).incoming += 1;
    }

    /// Head of the ready stack, if any.
    pub fn ready_front(&self) -> Option<NodeIndex> {
        self.ready.front().copied()
    }

    /// Moves a node to the tail of the pending list and marks it finished.
    pub fn park(&mut self, index: NodeIndex) {
        self.detach(index);
        self.pending.push_back(index);
        let node = self.node_mut(index);
        node.list = NodeList::Pending;
        node.state = NodeState::Finished;
    }

    /// Marks `index` as the node under dependency resolution. It stays on
    /// the ready stack in `Processing` state until its second visit.
    pub(crate) fn begin_visit(&mut self, index: NodeIndex) {
        self.cur = index;
        self.node_mut(index).state = NodeState::Processing;
    }

    /// Moves a node to the head of the ready stack without touching its
    /// state. Construction uses this to descend into unvisited nodes.
    pub(crate) fn move_to_front(&mut self, index: NodeIndex) {
        self.detach(index);
        self.ready.push_front(index);
        self.node_mut(index).list = NodeList::Ready;
    }

    /// Releases a node's successors: every destination not already in
    /// `Processing` is moved to the head of the ready stack, and all of the
    /// node's edges are removed, decrementing successor incoming counts.
    pub fn pop_node(&mut self, index: NodeIndex) {
        let edges =
            mem::replace(&mut self.node_mut(index).edges, Vec::new());

        for dest in edges.into_iter().rev() {
            if self.node(dest).state != NodeState::Processing {
                self.move_to_front(dest);
                self.node_mut(dest).state = NodeState::Processing;
            }

            self.node_mut(dest).incoming -= 1;
        }
    }

    /// Retires a node: unlinks it from whichever list it is on and frees
    /// its slot. Outgoing edges still attached are dropped *without*
    /// releasing their destinations, so dependents of a failed node stay
    /// blocked.
    pub fn remove_node(&mut self, index: NodeIndex) {
        self.detach(index);

        let node = self.slots[index.0].take().unwrap();

        if !node.edges.is_empty() {
            debug!(
                "node {} retired with {} unreleased edge(s)",
                node.id,
                node.edges.len()
            );
        }

        if self.ids.get(&node.id) == Some(&index) {
            self.ids.remove(&node.id);
        }
    }

    /// True once every node has been retired.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }

    fn detach(&mut self, index: NodeIndex) {
        let list = self.node(index).list;
        let queue = match list {
            NodeList::Ready => &mut self.ready,
            NodeList::Pending => &mut self.pending,
        };

        if let Some(pos) = queue.iter().position(|&i| i == index) {
            queue.remove(pos);
        }
    }
}

#[cfg(test)]
impl Graph {
    pub(crate) fn ready_ids(&self) -> Vec<NodeId> {
        self.ready.iter().map(|&i| self.node(i).id).collect()
    }

    pub(crate) fn pending_ids(&self) -> Vec<NodeId> {
        self.pending.iter().map(|&i| self.node(i).id).collect()
    }

    pub(crate) fn live_edges(&self) -> usize {
        self.slots.iter().flatten().map(|n| n.edges.len()).sum()
    }

    pub(crate) fn incoming_total(&self) -> usize {
        self.slots.iter().flatten().map(|n| n.incoming).sum()
    }
}
