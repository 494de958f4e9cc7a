//! Cycle detection over the waits-for graph of a stalled run.
//!
//! When the worker pool drains while claimed nodes are still unfinished, every
//! one of them is parked on some dependency. An edge `a -> b` means `a`
//! requested `b` and waits for it. Strongly connected components with more
//! than one key, or a key waiting on itself, are cycles.

use std::collections::VecDeque;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::key::NodeKey;

/// Cycles found in one waits-for graph.
#[derive(Debug, Default)]
pub(crate) struct CycleReport {
    /// One representative cycle per strongly connected component.
    pub(crate) cycles: Vec<Vec<NodeKey>>,
    /// Every key on a cycle, with a cycle through it that starts and ends
    /// with that key.
    pub(crate) members: Vec<(NodeKey, Vec<NodeKey>)>,
}

impl CycleReport {
    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Find the cycles among `edges`, given as `(waiter, dependency)` pairs.
pub(crate) fn find_cycles(edges: impl IntoIterator<Item = (NodeKey, NodeKey)>) -> CycleReport {
    let mut graph = DiGraph::<NodeKey, ()>::new();
    let mut index: ahash::HashMap<NodeKey, NodeIndex> = Default::default();
    let mut node = |graph: &mut DiGraph<NodeKey, ()>, key: NodeKey| {
        *index
            .entry(key.clone())
            .or_insert_with(|| graph.add_node(key))
    };
    for (waiter, dep) in edges {
        let from = node(&mut graph, waiter);
        let to = node(&mut graph, dep);
        graph.update_edge(from, to, ());
    }

    let mut report = CycleReport::default();
    for scc in tarjan_scc(&graph) {
        let cyclic = match scc.as_slice() {
            [single] => graph.contains_edge(*single, *single),
            _ => true,
        };
        if !cyclic {
            continue;
        }
        let members: ahash::HashSet<NodeIndex> = scc.iter().copied().collect();
        for (i, &member) in scc.iter().enumerate() {
            let path = cycle_through(&graph, &members, member);
            if i == 0 {
                report.cycles.push(path.clone());
            }
            report.members.push((graph[member].clone(), path));
        }
    }
    report
}

/// Shortest cycle from `start` back to itself, staying inside `members`.
fn cycle_through(
    graph: &DiGraph<NodeKey, ()>,
    members: &ahash::HashSet<NodeIndex>,
    start: NodeIndex,
) -> Vec<NodeKey> {
    let mut parent: ahash::HashMap<NodeIndex, NodeIndex> = Default::default();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors(current) {
            if next == start {
                let mut path = vec![current];
                let mut cursor = current;
                while cursor != start {
                    match parent.get(&cursor) {
                        Some(&p) => cursor = p,
                        None => break,
                    }
                    path.push(cursor);
                }
                let mut keys: Vec<NodeKey> =
                    path.into_iter().rev().map(|i| graph[i].clone()).collect();
                keys.push(graph[start].clone());
                return keys;
            }
            if members.contains(&next) && !parent.contains_key(&next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }
    vec![graph[start].clone()]
}
