// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::graph::{DependencyGraph, GraphError, NodeId, TxnIndex};
use meridian_types::{
    access::{AccessKind, AccessModelError, AccessOperation, Identifier, ResourceType},
    declarations::TransactionAccesses,
};
use std::collections::HashMap;

/// Per `(resource_type, access_kind)`, the identifier buckets of nodes that
/// produced that kind of access. Only populated with transactions strictly
/// earlier than the one currently being processed.
#[derive(Default)]
struct AccessIndex {
    buckets: HashMap<(ResourceType, AccessKind), HashMap<Identifier, Vec<NodeId>>>,
}

impl AccessIndex {
    fn record(&mut self, id: NodeId, op: &AccessOperation) {
        self.buckets
            .entry((op.resource_type, op.kind))
            .or_default()
            .entry(op.identifier.clone())
            .or_default()
            .push(id);
    }

    /// Node ids of prior accesses of any of `kinds` whose scope overlaps
    /// `op`: same resource type with wildcard/equal identifiers, or any
    /// identifier on an ancestor or descendant type.
    fn matches(&self, op: &AccessOperation, kinds: &[AccessKind], out: &mut Vec<NodeId>) {
        for kind in kinds {
            if let Some(by_identifier) = self.buckets.get(&(op.resource_type, *kind)) {
                if op.identifier.is_wildcard() {
                    for ids in by_identifier.values() {
                        out.extend_from_slice(ids);
                    }
                } else {
                    for bucket in [&op.identifier, &Identifier::Wildcard] {
                        if let Some(ids) = by_identifier.get(bucket) {
                            out.extend_from_slice(ids);
                        }
                    }
                }
            }

            for related in op
                .resource_type
                .ancestors()
                .chain(op.resource_type.descendants())
            {
                if let Some(by_identifier) = self.buckets.get(&(related, *kind)) {
                    for ids in by_identifier.values() {
                        out.extend_from_slice(ids);
                    }
                }
            }
        }
    }
}

/// Which prior access kinds gate a new operation of `kind`.
fn gating_kinds(kind: AccessKind) -> &'static [AccessKind] {
    match kind {
        AccessKind::Read => &[AccessKind::Write, AccessKind::Unknown],
        AccessKind::Write | AccessKind::Unknown => {
            &[AccessKind::Write, AccessKind::Unknown, AccessKind::Read]
        },
        AccessKind::Commit => &[],
    }
}

/// Builds the ordering-constraint DAG for one ordered batch.
///
/// This is the single point where declared operations enter the model, and
/// therefore the single point where they are validated; producers are never
/// trusted to have validated their own declarations. Each transaction gets
/// exactly one synthetic COMMIT anchor appended here, every one of its other
/// nodes is wired to reach that anchor, and every cross-transaction edge is
/// anchored at the earlier transaction's COMMIT node.
pub fn build_dependency_graph(
    batch: &[TransactionAccesses],
) -> Result<DependencyGraph, GraphError> {
    let mut graph = DependencyGraph::with_txns(batch.len());
    let mut index = AccessIndex::default();
    let mut match_scratch = Vec::new();

    for (txn_idx, accesses) in batch.iter().enumerate() {
        let txn_idx = txn_idx as TxnIndex;

        for (_, op) in accesses.indexed_ops() {
            // Commit anchors are appended by the builder; a declared one is
            // a malformed declaration.
            if op.is_commit() {
                return Err(AccessModelError::MisplacedCommit.into());
            }
            op.validate().map_err(GraphError::Model)?;
        }

        let mut txn_nodes: Vec<(NodeId, &AccessOperation)> = Vec::new();
        for (message_idx, op) in accesses.indexed_ops() {
            let id = graph.add_node(txn_idx, message_idx, op.clone());

            match_scratch.clear();
            index.matches(op, gating_kinds(op.kind), &mut match_scratch);
            for matched in &match_scratch {
                let earlier_txn = graph.node(*matched).txn_idx;
                debug_assert!(earlier_txn < txn_idx);
                // Anchor on the earlier transaction's commit node, never on
                // the matched operation node itself.
                graph.add_edge(graph.commit_node(earlier_txn), id);
                graph.record_predecessor(txn_idx, earlier_txn);
            }

            txn_nodes.push((id, op));
        }

        let commit_idx = accesses.messages.len() + 1;
        let commit_id = graph.add_node(txn_idx, commit_idx, AccessOperation::commit());
        graph.set_commit_node(txn_idx, commit_id);
        for (id, _) in &txn_nodes {
            graph.add_edge(*id, commit_id);
        }

        // Publish this transaction's accesses for later transactions only
        // after all of its own nodes are placed, so a transaction never
        // matches against itself.
        for (id, op) in txn_nodes {
            index.record(id, op);
        }
    }

    graph.verify_acyclic()?;
    Ok(graph)
}
