// Copyright © Meridian Contributors
// SPDX-License-Identifier: Apache-2.0

//! Converts one ordered batch of per-transaction access-operation lists into
//! a DAG of ordering constraints. The builder is single-threaded and purely
//! functional over its immutable inputs; it runs once per batch before
//! scheduling begins, so the graph itself is read-only shared state.

mod builder;
mod graph;

pub use builder::build_dependency_graph;
pub use graph::{DependencyGraph, GraphError, Node, NodeId, TxnIndex};
