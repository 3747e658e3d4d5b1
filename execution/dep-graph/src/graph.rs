// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_types::access::{AccessModelError, AccessOperation};
use std::collections::{BTreeSet, HashSet, VecDeque};
use thiserror::Error;

pub type TxnIndex = u32;

/// Stable identity of a graph node within one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// One access operation of one transaction unit, placed in the graph.
/// Envelope-level operations carry `message_idx` 0, message `i` operations
/// carry `i + 1`, and the commit anchor sits past the last message.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub txn_idx: TxnIndex,
    pub message_idx: usize,
    pub op: AccessOperation,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Model(#[from] AccessModelError),
    #[error("dependency cycle detected involving transactions {0:?}")]
    Cycle(Vec<TxnIndex>),
}

/// The ordering-constraint DAG for one batch. Edges run from an earlier
/// node to a later one, meaning the later node may not be considered valid
/// until the earlier node's owning transaction has fully committed; every
/// cross-transaction edge originates at a COMMIT node.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    edges_out: Vec<Vec<NodeId>>,
    edge_set: HashSet<(NodeId, NodeId)>,
    commit_nodes: Vec<Option<NodeId>>,
    predecessor_txns: Vec<BTreeSet<TxnIndex>>,
}

impl DependencyGraph {
    pub(crate) fn with_txns(num_txns: usize) -> Self {
        Self {
            nodes: Vec::new(),
            edges_out: Vec::new(),
            edge_set: HashSet::new(),
            commit_nodes: vec![None; num_txns],
            predecessor_txns: vec![BTreeSet::new(); num_txns],
        }
    }

    pub(crate) fn add_node(
        &mut self,
        txn_idx: TxnIndex,
        message_idx: usize,
        op: AccessOperation,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            txn_idx,
            message_idx,
            op,
        });
        self.edges_out.push(Vec::new());
        id
    }

    pub(crate) fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if self.edge_set.insert((from, to)) {
            self.edges_out[from.0].push(to);
        }
    }

    pub(crate) fn set_commit_node(&mut self, txn_idx: TxnIndex, id: NodeId) {
        self.commit_nodes[txn_idx as usize] = Some(id);
    }

    pub(crate) fn record_predecessor(&mut self, txn_idx: TxnIndex, predecessor: TxnIndex) {
        self.predecessor_txns[txn_idx as usize].insert(predecessor);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_txns(&self) -> usize {
        self.commit_nodes.len()
    }

    pub fn out_edges(&self, id: NodeId) -> &[NodeId] {
        &self.edges_out[id.0]
    }

    /// The transaction's synchronization point: its COMMIT anchor node.
    pub fn commit_node(&self, txn_idx: TxnIndex) -> NodeId {
        self.commit_nodes[txn_idx as usize].expect("Commit node must be set for every transaction")
    }

    /// Direct predecessor transactions of `txn_idx`.
    pub fn predecessors(&self, txn_idx: TxnIndex) -> &BTreeSet<TxnIndex> {
        &self.predecessor_txns[txn_idx as usize]
    }

    /// Predecessor sets of all transactions, indexed by transaction.
    pub fn predecessor_lists(&self) -> Vec<Vec<TxnIndex>> {
        self.predecessor_txns
            .iter()
            .map(|preds| preds.iter().copied().collect())
            .collect()
    }

    /// Inverse of [`Self::predecessor_lists`]: for each transaction, the
    /// transactions that directly depend on its commit.
    pub fn dependent_lists(&self) -> Vec<Vec<TxnIndex>> {
        let mut dependents = vec![Vec::new(); self.num_txns()];
        for (txn_idx, preds) in self.predecessor_txns.iter().enumerate() {
            for pred in preds {
                dependents[*pred as usize].push(txn_idx as TxnIndex);
            }
        }
        dependents
    }

    /// Kahn toposort over the node arena. A cycle is a hard failure for the
    /// whole batch: it indicates a modeling bug, not a transient condition.
    pub fn verify_acyclic(&self) -> Result<(), GraphError> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for targets in &self.edges_out {
            for to in targets {
                indegree[to.0] += 1;
            }
        }

        let mut queue: VecDeque<NodeId> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| NodeId(i))
            .collect();
        let mut processed = 0usize;
        while let Some(id) = queue.pop_front() {
            processed += 1;
            for to in &self.edges_out[id.0] {
                indegree[to.0] -= 1;
                if indegree[to.0] == 0 {
                    queue.push_back(*to);
                }
            }
        }

        if processed == self.nodes.len() {
            Ok(())
        } else {
            let cyclic: BTreeSet<TxnIndex> = indegree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.nodes[i].txn_idx)
                .collect();
            Err(GraphError::Cycle(cyclic.into_iter().collect()))
        }
    }
}
