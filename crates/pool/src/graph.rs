//! Dependency graph between submitted tasks.
//!
//! Nodes are submitted tasks; a directed edge `p -> c` means *c depends on
//! p*. Edges are tagged [`EdgeState::Pending`] until the parent's epilogue
//! completes them. Nodes live in a `BTreeMap` keyed by [`TaskId`] so that
//! readiness extraction walks tasks in the stable order ids were minted.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::types::{TaskBody, TaskId};

/// Tag on a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeState {
	/// The parent has not finished; the child may not run.
	Pending,
	/// The parent's epilogue has run; the dependency is satisfied.
	Completed,
}

/// A graph node and its adjacencies.
pub(crate) struct TaskNode<T> {
	/// Body, present until the driver reserves the node for spawning.
	body: Option<TaskBody<T>>,
	/// The epilogue removes this task's process-table entry instead of
	/// publishing its outcome.
	detached: bool,
	/// The epilogue has run; every outgoing edge is completed.
	finished: bool,
	/// Incoming edges, keyed by parent.
	parents: BTreeMap<TaskId, EdgeState>,
	/// Outgoing edge targets. The tag of edge `self -> c` lives on `c`.
	children: FxHashSet<TaskId>,
}

/// A node reserved for spawning: its body has been taken out of the graph.
pub(crate) struct ReadyTask<T> {
	pub(crate) id: TaskId,
	pub(crate) body: TaskBody<T>,
	pub(crate) detached: bool,
}

/// DAG of submitted tasks with pending/completed dependency edges.
pub(crate) struct TaskGraph<T> {
	nodes: BTreeMap<TaskId, TaskNode<T>>,
}

impl<T> TaskGraph<T> {
	pub(crate) fn new() -> Self {
		Self { nodes: BTreeMap::new() }
	}

	pub(crate) fn len(&self) -> usize {
		self.nodes.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub(crate) fn contains(&self, id: TaskId) -> bool {
		self.nodes.contains_key(&id)
	}

	/// Inserts a fresh node with no edges.
	pub(crate) fn insert(&mut self, id: TaskId, body: TaskBody<T>, detached: bool) {
		self.nodes.insert(id, TaskNode {
			body: Some(body),
			detached,
			finished: false,
			parents: BTreeMap::new(),
			children: FxHashSet::default(),
		});
	}

	/// Adds a dependency edge `parent -> child`.
	///
	/// No-op when the parent is absent (already finished and pruned, or
	/// cancelled) so the child is not blocked on a vanished parent, when the
	/// child is absent or already reserved (the edge can no longer gate
	/// anything), or when the edge would create a cycle. An edge from a
	/// finished-but-retained parent is inserted already completed.
	///
	/// Returns true if an edge was inserted.
	pub(crate) fn link(&mut self, parent: TaskId, child: TaskId) -> bool {
		let Some(parent_node) = self.nodes.get(&parent) else {
			return false;
		};
		let parent_finished = parent_node.finished;
		match self.nodes.get(&child) {
			Some(child_node) if child_node.body.is_some() => {}
			_ => return false,
		}
		if parent == child || self.reaches(child, parent) {
			tracing::warn!(parent = %parent, child = %child, "pool.sequence: refused cyclic edge");
			return false;
		}

		let state = if parent_finished { EdgeState::Completed } else { EdgeState::Pending };
		if let Some(child_node) = self.nodes.get_mut(&child) {
			child_node.parents.insert(parent, state);
		}
		if let Some(parent_node) = self.nodes.get_mut(&parent) {
			parent_node.children.insert(child);
		}
		true
	}

	/// Returns true when `to` is reachable from `from` over successor edges.
	fn reaches(&self, from: TaskId, to: TaskId) -> bool {
		let mut stack = vec![from];
		let mut walked = FxHashSet::default();
		while let Some(id) = stack.pop() {
			if id == to {
				return true;
			}
			if !walked.insert(id) {
				continue;
			}
			if let Some(node) = self.nodes.get(&id) {
				stack.extend(node.children.iter().copied());
			}
		}
		false
	}

	/// Takes up to `limit` ready nodes in ascending id order.
	///
	/// A node is ready when its body has never been reserved and every
	/// incoming edge is completed. Body presence also rules out running
	/// tasks and finished ancestors retained for their dependents, since
	/// both had their body taken long ago. Reserved nodes stay in the graph
	/// until their epilogue mutates it.
	pub(crate) fn take_ready(&mut self, limit: usize) -> Vec<ReadyTask<T>> {
		if limit == 0 {
			return Vec::new();
		}
		let ready: Vec<TaskId> = self
			.nodes
			.iter()
			.filter(|(_, node)| {
				node.body.is_some() && node.parents.values().all(|e| *e == EdgeState::Completed)
			})
			.map(|(id, _)| *id)
			.take(limit)
			.collect();

		let mut reserved = Vec::with_capacity(ready.len());
		for id in ready {
			if let Some(node) = self.nodes.get_mut(&id)
				&& let Some(body) = node.body.take()
			{
				reserved.push(ReadyTask { id, body, detached: node.detached });
			}
		}
		reserved
	}

	/// Applies a finished task's graph mutation.
	///
	/// With no dependents the node is pruned, along with finished ancestors
	/// whose out-degree drops to zero. Otherwise every outgoing edge is
	/// completed and the node is retained so dependents can observe it.
	/// No-op when the node is absent (cancelled while running).
	pub(crate) fn complete(&mut self, id: TaskId) {
		let Some(node) = self.nodes.get_mut(&id) else {
			return;
		};
		node.finished = true;
		let children: Vec<TaskId> = node.children.iter().copied().collect();
		if children.is_empty() {
			self.prune(id);
			return;
		}
		for child in children {
			if let Some(child_node) = self.nodes.get_mut(&child) {
				child_node.parents.insert(id, EdgeState::Completed);
			}
		}
	}

	/// Removes a node with no remaining dependents, recursing into finished
	/// ancestors whose last dependent this was.
	fn prune(&mut self, id: TaskId) {
		let Some(node) = self.nodes.remove(&id) else {
			return;
		};
		for parent in node.parents.keys() {
			self.unlink_child(*parent, id);
		}
	}

	/// Drops `child` from `parent`'s successors, pruning `parent` if it was
	/// a finished node retained solely for that dependent.
	fn unlink_child(&mut self, parent: TaskId, child: TaskId) {
		let Some(parent_node) = self.nodes.get_mut(&parent) else {
			return;
		};
		parent_node.children.remove(&child);
		if parent_node.finished && parent_node.children.is_empty() {
			self.prune(parent);
		}
	}

	/// Removes `root` and every transitive dependent from the graph.
	///
	/// Returns the removed ids. Finished ancestors outside the closure whose
	/// out-degree drops to zero are pruned as well, but are not reported:
	/// they were not cancelled, and their unconsumed results stay observable.
	pub(crate) fn remove_subtree(&mut self, root: TaskId) -> Vec<TaskId> {
		if !self.nodes.contains_key(&root) {
			return Vec::new();
		}

		// Downward closure over successor edges.
		let mut doomed = FxHashSet::default();
		let mut order = Vec::new();
		let mut stack = vec![root];
		while let Some(id) = stack.pop() {
			if !doomed.insert(id) {
				continue;
			}
			order.push(id);
			if let Some(node) = self.nodes.get(&id) {
				stack.extend(node.children.iter().copied());
			}
		}

		for id in &order {
			if let Some(node) = self.nodes.remove(id) {
				for parent in node.parents.keys() {
					if !doomed.contains(parent) {
						self.unlink_child(*parent, *id);
					}
				}
			}
		}
		order
	}

	/// Counts nodes whose body has not been reserved.
	pub(crate) fn queued(&self) -> usize {
		self.nodes.values().filter(|node| node.body.is_some()).count()
	}

	/// Empties the graph.
	pub(crate) fn clear(&mut self) {
		self.nodes.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn body() -> TaskBody<()> {
		Box::pin(async { Ok(()) })
	}

	fn graph_with(ids: &[u64]) -> TaskGraph<()> {
		let mut graph = TaskGraph::new();
		for &id in ids {
			graph.insert(TaskId(id), body(), false);
		}
		graph
	}

	fn ready_ids(graph: &mut TaskGraph<()>, limit: usize) -> Vec<TaskId> {
		graph.take_ready(limit).into_iter().map(|t| t.id).collect()
	}

	#[test]
	fn fresh_node_is_ready() {
		let mut graph = graph_with(&[1]);
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(1)]);
	}

	#[test]
	fn pending_edge_blocks_child_until_completion() {
		let mut graph = graph_with(&[1, 2]);
		assert!(graph.link(TaskId(1), TaskId(2)));

		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(1)]);
		// Parent reserved but not finished: child still blocked.
		assert_eq!(ready_ids(&mut graph, 8), vec![]);

		graph.complete(TaskId(1));
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(2)]);
	}

	#[test]
	fn take_ready_respects_limit_and_id_order() {
		let mut graph = graph_with(&[3, 1, 2]);
		assert_eq!(ready_ids(&mut graph, 2), vec![TaskId(1), TaskId(2)]);
		assert_eq!(ready_ids(&mut graph, 2), vec![TaskId(3)]);
		assert_eq!(ready_ids(&mut graph, 2), vec![]);
	}

	#[test]
	fn take_ready_zero_limit_is_empty() {
		let mut graph = graph_with(&[1]);
		assert_eq!(ready_ids(&mut graph, 0), vec![]);
	}

	#[test]
	fn completed_leaf_is_pruned_with_finished_ancestors() {
		let mut graph = graph_with(&[1, 2]);
		graph.link(TaskId(1), TaskId(2));

		ready_ids(&mut graph, 1);
		graph.complete(TaskId(1));
		// Parent finished but retained for its dependent.
		assert!(graph.contains(TaskId(1)));

		ready_ids(&mut graph, 1);
		graph.complete(TaskId(2));
		assert!(graph.is_empty(), "leaf completion must prune the retained ancestor");
	}

	#[test]
	fn link_to_finished_parent_is_already_satisfied() {
		let mut graph = graph_with(&[1, 2]);
		graph.link(TaskId(1), TaskId(2));
		ready_ids(&mut graph, 1);
		graph.complete(TaskId(1));

		graph.insert(TaskId(3), body(), false);
		assert!(graph.link(TaskId(1), TaskId(3)));
		// Ids 2 and 3 both runnable: the finished parent gates neither.
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(2), TaskId(3)]);
	}

	#[test]
	fn link_with_absent_parent_is_noop() {
		let mut graph = graph_with(&[2]);
		assert!(!graph.link(TaskId(1), TaskId(2)));
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(2)]);
	}

	#[test]
	fn link_to_reserved_child_is_noop() {
		let mut graph = graph_with(&[1, 2]);
		assert_eq!(ready_ids(&mut graph, 1), vec![TaskId(1)]);
		assert!(!graph.link(TaskId(2), TaskId(1)), "a reserved body can no longer be gated");
	}

	#[test]
	fn cyclic_link_is_refused() {
		let mut graph = graph_with(&[1, 2, 3]);
		graph.link(TaskId(1), TaskId(2));
		graph.link(TaskId(2), TaskId(3));
		assert!(!graph.link(TaskId(3), TaskId(1)));
		assert!(!graph.link(TaskId(1), TaskId(1)));
	}

	#[test]
	fn remove_subtree_takes_downward_closure_only() {
		// 1 -> 2 -> 3, 1 -> 4
		let mut graph = graph_with(&[1, 2, 3, 4]);
		graph.link(TaskId(1), TaskId(2));
		graph.link(TaskId(2), TaskId(3));
		graph.link(TaskId(1), TaskId(4));

		let removed = graph.remove_subtree(TaskId(2));
		assert!(removed.contains(&TaskId(2)) && removed.contains(&TaskId(3)));
		assert_eq!(removed.len(), 2);
		assert!(graph.contains(TaskId(1)));
		assert!(graph.contains(TaskId(4)));
	}

	#[test]
	fn remove_subtree_prunes_finished_ancestor_residue() {
		let mut graph = graph_with(&[1, 2]);
		graph.link(TaskId(1), TaskId(2));
		ready_ids(&mut graph, 1);
		graph.complete(TaskId(1));

		let removed = graph.remove_subtree(TaskId(2));
		assert_eq!(removed, vec![TaskId(2)]);
		assert!(graph.is_empty(), "the retained ancestor lost its last dependent");
	}

	#[test]
	fn remove_subtree_of_absent_node_is_empty() {
		let mut graph = graph_with(&[1]);
		assert!(graph.remove_subtree(TaskId(9)).is_empty());
		assert!(graph.contains(TaskId(1)));
	}

	#[test]
	fn complete_absent_node_is_noop() {
		let mut graph = graph_with(&[1]);
		graph.complete(TaskId(9));
		assert_eq!(graph.len(), 1);
	}

	#[test]
	fn diamond_completion_order() {
		// 1 -> {2, 3} -> 4
		let mut graph = graph_with(&[1, 2, 3, 4]);
		graph.link(TaskId(1), TaskId(2));
		graph.link(TaskId(1), TaskId(3));
		graph.link(TaskId(2), TaskId(4));
		graph.link(TaskId(3), TaskId(4));

		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(1)]);
		graph.complete(TaskId(1));
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(2), TaskId(3)]);
		graph.complete(TaskId(2));
		assert_eq!(ready_ids(&mut graph, 8), vec![], "one pending parent still gates the sink");
		graph.complete(TaskId(3));
		assert_eq!(ready_ids(&mut graph, 8), vec![TaskId(4)]);
		graph.complete(TaskId(4));
		assert!(graph.is_empty());
	}
}
