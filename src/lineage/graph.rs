//! Adjacency-indexed edge set and lazy breadth-first walks.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;

use super::model::{ArtifactId, LineageEdge, RelationshipKind, Transformation};
use uuid::Uuid;

/// Traversal direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Artifact to its derivatives
    Forward,
    /// Artifact to its raw origins
    Backward,
}

/// Append-only DAG.
///
/// Edges live in one vector; `outgoing`/`incoming` index into it.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    edges: Vec<LineageEdge>,
    outgoing: FxHashMap<ArtifactId, Vec<usize>>,
    incoming: FxHashMap<ArtifactId, Vec<usize>>,
    keys: FxHashSet<(ArtifactId, ArtifactId, RelationshipKind)>,
    transformations: FxHashMap<Uuid, Transformation>,
}

impl LineageGraph {
    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[LineageEdge] {
        &self.edges
    }

    /// Whether an identical edge exists.
    #[must_use]
    pub fn contains(&self, source: &ArtifactId, target: &ArtifactId, kind: RelationshipKind) -> bool {
        self.keys.contains(&(source.clone(), target.clone(), kind))
    }

    /// Whether `to` is reachable from `from` following edges forward.
    #[must_use]
    pub fn reaches(&self, from: &ArtifactId, to: &ArtifactId) -> bool {
        if from == to {
            return true;
        }
        let mut seen: FxHashSet<&ArtifactId> = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            for &idx in self.outgoing.get(node).map_or(&[][..], Vec::as_slice) {
                let next = &self.edges[idx].target;
                if next == to {
                    return true;
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Stored transformation.
    #[must_use]
    pub fn transformation(&self, id: &Uuid) -> Option<&Transformation> {
        self.transformations.get(id)
    }

    pub(super) fn push(&mut self, edge: LineageEdge) {
        let idx = self.edges.len();
        self.outgoing.entry(edge.source.clone()).or_default().push(idx);
        self.incoming.entry(edge.target.clone()).or_default().push(idx);
        self.keys
            .insert((edge.source.clone(), edge.target.clone(), edge.kind));
        self.edges.push(edge);
    }

    pub(super) fn put_transformation(&mut self, transformation: Transformation) {
        self.transformations
            .entry(transformation.id)
            .or_insert(transformation);
    }

    /// Drop edges appended after `len` (batch rollback).
    pub(super) fn truncate(&mut self, len: usize) {
        while self.edges.len() > len {
            let Some(edge) = self.edges.pop() else { break };
            pop_index(&mut self.outgoing, &edge.source);
            pop_index(&mut self.incoming, &edge.target);
            self.keys.remove(&(edge.source, edge.target, edge.kind));
        }
    }

    fn adjacent(&self, node: &ArtifactId, direction: Direction) -> &[usize] {
        let index = match direction {
            Direction::Forward => &self.outgoing,
            Direction::Backward => &self.incoming,
        };
        index.get(node).map_or(&[][..], Vec::as_slice)
    }
}

fn pop_index(index: &mut FxHashMap<ArtifactId, Vec<usize>>, node: &ArtifactId) {
    if let Some(list) = index.get_mut(node) {
        list.pop();
        if list.is_empty() {
            index.remove(node);
        }
    }
}

/// Lazily produced breadth-first edge sequence over a graph snapshot.
///
/// Each edge is yielded once. `restart` rewinds to the start artifact; the
/// snapshot is fixed, so a restarted walk yields the same sequence.
#[derive(Debug, Clone)]
pub struct LineageWalk {
    graph: Arc<LineageGraph>,
    start: ArtifactId,
    direction: Direction,
    max_depth: Option<usize>,
    queue: VecDeque<(ArtifactId, usize)>,
    visited: FxHashSet<ArtifactId>,
    current: Option<(ArtifactId, usize, usize)>,
}

impl LineageWalk {
    pub(super) fn new(
        graph: Arc<LineageGraph>,
        start: ArtifactId,
        direction: Direction,
        max_depth: Option<usize>,
    ) -> Self {
        let mut walk = Self {
            graph,
            start,
            direction,
            max_depth,
            queue: VecDeque::new(),
            visited: FxHashSet::default(),
            current: None,
        };
        walk.restart();
        walk
    }

    /// Rewind to the first edge.
    pub fn restart(&mut self) {
        self.queue.clear();
        self.visited.clear();
        self.current = None;
        self.visited.insert(self.start.clone());
        self.queue.push_back((self.start.clone(), 0));
    }

    /// Start artifact.
    #[must_use]
    pub const fn start(&self) -> &ArtifactId {
        &self.start
    }

    /// Traversal direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    fn far_end<'a>(&self, edge: &'a LineageEdge) -> &'a ArtifactId {
        match self.direction {
            Direction::Forward => &edge.target,
            Direction::Backward => &edge.source,
        }
    }
}

impl Iterator for LineageWalk {
    type Item = LineageEdge;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((node, depth, pos)) = self.current.take() {
                let graph = Arc::clone(&self.graph);
                let adjacent = graph.adjacent(&node, self.direction);
                if let Some(&idx) = adjacent.get(pos) {
                    let edge = &graph.edges[idx];
                    let next = self.far_end(edge).clone();
                    if self.visited.insert(next.clone()) {
                        self.queue.push_back((next, depth + 1));
                    }
                    self.current = Some((node, depth, pos + 1));
                    return Some(edge.clone());
                }
            }

            let (node, depth) = self.queue.pop_front()?;
            if self.max_depth.map_or(true, |max| depth < max) {
                self.current = Some((node, depth, 0));
            }
        }
    }
}
