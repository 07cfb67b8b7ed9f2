//! Named frames and shortest-path pose composition (component E, §3 / §9),
//! grounded on the reference implementation's `FrameSystem`: an undirected
//! adjacency where every stored edge contributes a forward traversal weight
//! of 1 and an inverse traversal weight of 2 (breaking ties so the cheapest
//! path prefers the direction the edge was actually recorded in).

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::WandelscriptError;
use crate::value::Pose;

#[derive(Debug, Clone, Copy)]
struct Edge {
    transform: Pose,
    forward: bool,
}

pub struct FrameGraph {
    frames: HashSet<String>,
    // keyed by (a, b) meaning "transform of b expressed in a's frame";
    // `forward` edges were recorded a->b directly.
    edges: HashMap<(String, String), Edge>,
}

impl FrameGraph {
    pub fn new() -> Self {
        FrameGraph { frames: HashSet::new(), edges: HashMap::new() }
    }

    pub fn add_frame(&mut self, name: &str) {
        self.frames.insert(name.to_owned());
    }

    pub fn frames(&self) -> impl Iterator<Item = &String> {
        self.frames.iter()
    }

    /// Record `transform` as the pose of `child` expressed in `parent`'s
    /// frame, creating both frames if missing.
    pub fn set_relation(&mut self, parent: &str, child: &str, transform: Pose) {
        self.add_frame(parent);
        self.add_frame(child);
        self.edges.insert((parent.to_owned(), child.to_owned()), Edge { transform, forward: true });
        self.edges.insert((child.to_owned(), parent.to_owned()), Edge { transform: transform.inverse(), forward: false });
    }

    fn adjacency(&self, node: &str) -> Vec<(&String, &Edge)> {
        self.edges.iter().filter(|((a, _), _)| a == node).map(|((_, b), e)| (b, e)).collect()
    }

    /// `eval(target, source)`: the transform taking `source`-frame
    /// coordinates to `target`-frame coordinates, found via Dijkstra over the
    /// undirected graph (§9).
    pub fn eval(&self, target: &str, source: &str) -> Result<Pose, WandelscriptError> {
        if target == source {
            return Ok(Pose::identity());
        }
        if !self.frames.contains(target) || !self.frames.contains(source) {
            return Err(WandelscriptError::configuration(format!(
                "no path between frames '{source}' and '{target}'"
            )));
        }

        #[derive(PartialEq)]
        struct HeapEntry(f64, String);
        impl Eq for HeapEntry {}
        impl Ord for HeapEntry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                other.0.partial_cmp(&self.0).unwrap_or(std::cmp::Ordering::Equal)
            }
        }
        impl PartialOrd for HeapEntry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut dist: HashMap<String, f64> = HashMap::new();
        let mut prev: HashMap<String, (String, Pose)> = HashMap::new();
        let mut heap = BinaryHeap::new();
        dist.insert(target.to_owned(), 0.0);
        heap.push(HeapEntry(0.0, target.to_owned()));

        while let Some(HeapEntry(cost, node)) = heap.pop() {
            if node == source {
                break;
            }
            if cost > *dist.get(&node).unwrap_or(&f64::INFINITY) {
                continue;
            }
            for (neighbor, edge) in self.adjacency(&node) {
                let weight = if edge.forward { 1.0 } else { 2.0 };
                let next_cost = cost + weight;
                if next_cost < *dist.get(neighbor).unwrap_or(&f64::INFINITY) {
                    dist.insert(neighbor.clone(), next_cost);
                    // edge transform stored as "pose of neighbor expressed in node";
                    // to go node -> neighbor we need neighbor's pose in node's frame.
                    prev.insert(neighbor.clone(), (node.clone(), edge.transform));
                    heap.push(HeapEntry(next_cost, neighbor.clone()));
                }
            }
        }

        if !prev.contains_key(source) && source != target {
            return Err(WandelscriptError::configuration(format!(
                "no path between frames '{source}' and '{target}'"
            )));
        }

        // Walk back from `source` to `target`, composing transforms. Each
        // step's edge gives the pose of the farther node expressed in the
        // nearer node's frame; composing source->...->target accumulates the
        // transform from source coordinates into target coordinates.
        let mut node = source.to_owned();
        let mut result = Pose::identity();
        while node != target {
            let (prev_node, transform) = prev.get(&node).expect("path reconstructed from dijkstra").clone();
            result = transform.compose(result);
            node = prev_node;
        }
        Ok(result)
    }
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Vector3;

    #[test]
    fn direct_relation_round_trips() {
        let mut graph = FrameGraph::new();
        let transform = Pose::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zero());
        graph.set_relation("world", "a", transform);
        let result = graph.eval("world", "a").unwrap();
        assert!(result.approx_eq(transform, 1e-9));
        let inverse = graph.eval("a", "world").unwrap();
        assert!(inverse.approx_eq(transform.inverse(), 1e-9));
    }

    #[test]
    fn chained_relations_compose() {
        let mut graph = FrameGraph::new();
        graph.set_relation("world", "a", Pose::new(Vector3::new(1.0, 0.0, 0.0), Vector3::zero()));
        graph.set_relation("a", "b", Pose::new(Vector3::new(0.0, 1.0, 0.0), Vector3::zero()));
        let result = graph.eval("world", "b").unwrap();
        assert!(result.approx_eq(Pose::new(Vector3::new(1.0, 1.0, 0.0), Vector3::zero()), 1e-9));
    }

    #[test]
    fn missing_path_is_an_error() {
        let mut graph = FrameGraph::new();
        graph.add_frame("isolated");
        graph.add_frame("other");
        assert!(graph.eval("isolated", "other").is_err());
    }

    #[test]
    fn same_frame_is_identity() {
        let graph = FrameGraph::new();
        assert!(graph.eval("x", "x").unwrap().approx_eq(Pose::identity(), 1e-9));
    }
}
