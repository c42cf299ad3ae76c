//! Feature correspondences across frames and their grouping into tracks.

use nalgebra::Point2;
use std::collections::{BTreeMap, BTreeSet};

/// A keypoint, identified by `(frame index, keypoint index)`.
pub type Node = (usize, usize);

/// One observation of a track: frame index and image position.
pub type Observation = (usize, Point2<f64>);

/// Observations of the same scene point, at most one per frame.
pub type MatchGroup = Vec<Observation>;

/// Undirected graph of keypoint correspondences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchGraph {
    edges: BTreeMap<Node, Vec<Node>>,
}

impl MatchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the edge in both directions.
    pub fn add_match(&mut self, a: Node, b: Node) {
        self.edges.entry(a).or_default().push(b);
        self.edges.entry(b).or_default().push(a);
    }

    /// Appends every edge of `other`.
    pub fn merge(&mut self, other: &MatchGraph) {
        for (node, neighbours) in &other.edges {
            self.edges.entry(*node).or_default().extend(neighbours);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Number of nodes with at least one edge.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn neighbours(&self, node: &Node) -> &[Node] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.edges.keys()
    }

    /// Connected components, each listed in depth-first order.
    pub fn components(&self) -> Vec<Vec<Node>> {
        let mut visited = BTreeSet::new();
        let mut components = Vec::new();
        for start in self.edges.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut component = Vec::new();
            let mut stack = vec![*start];
            while let Some(node) = stack.pop() {
                if !visited.insert(node) {
                    continue;
                }
                component.push(node);
                stack.extend(self.neighbours(&node).iter().rev().filter(|n| !visited.contains(*n)));
            }
            components.push(component);
        }
        components
    }
}

/// Splits the graph into tracks with one observation per frame.
///
/// Several keypoints of the same frame in one component are collapsed into
/// their mean when their per-axis variance stays within `max_std²`; otherwise
/// the whole component is dropped as a noisy merge. Components spanning a
/// single frame constrain nothing and are dropped too. `locate` maps a node
/// to its image position; nodes it cannot place are ignored.
pub fn group_matches<F>(graph: &MatchGraph, locate: F, max_std: f64) -> Vec<MatchGroup>
where
    F: Fn(Node) -> Option<Point2<f64>>,
{
    let mut groups = Vec::new();
    'components: for component in graph.components() {
        let mut by_frame: BTreeMap<usize, Vec<Point2<f64>>> = BTreeMap::new();
        for node in component {
            if let Some(p) = locate(node) {
                by_frame.entry(node.0).or_default().push(p);
            }
        }

        let mut group = Vec::with_capacity(by_frame.len());
        for (frame, points) in by_frame {
            if let [p] = points.as_slice() {
                group.push((frame, *p));
                continue;
            }

            let n = points.len() as f64;
            let (mut sx, mut sy, mut sxx, mut syy) = (0.0, 0.0, 0.0, 0.0);
            for p in &points {
                sx += p.x;
                sy += p.y;
                sxx += p.x * p.x;
                syy += p.y * p.y;
            }
            let mean = Point2::new(sx / n, sy / n);
            let var_x = sxx / n - mean.x * mean.x;
            let var_y = syy / n - mean.y * mean.y;
            if var_x.hypot(var_y) > max_std * max_std {
                continue 'components;
            }
            group.push((frame, mean));
        }

        if group.len() >= 2 {
            groups.push(group);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(node: Node) -> Option<Point2<f64>> {
        Some(Point2::new(node.1 as f64 * 10.0, node.0 as f64))
    }

    #[test]
    fn test_merge_keeps_both_directions() {
        let mut a = MatchGraph::new();
        a.add_match((0, 1), (1, 2));
        let mut b = MatchGraph::new();
        b.add_match((1, 2), (2, 3));
        a.merge(&b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.neighbours(&(1, 2)), &[(0, 1), (2, 3)]);
        assert!(a.neighbours(&(5, 5)).is_empty());
    }

    #[test]
    fn test_three_frames_form_one_group() {
        let mut graph = MatchGraph::new();
        graph.add_match((0, 4), (1, 7));
        graph.add_match((1, 7), (2, 1));
        graph.add_match((0, 4), (2, 1));
        graph.add_match((0, 9), (1, 3));

        let groups = group_matches(&graph, positions, 15.0);
        assert_eq!(groups.len(), 2);
        let frames: Vec<usize> = groups[0].iter().map(|o| o.0).collect();
        assert_eq!(frames, vec![0, 1, 2]);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn test_same_frame_duplicates_are_averaged() {
        let mut graph = MatchGraph::new();
        graph.add_match((0, 1), (1, 1));
        graph.add_match((0, 2), (1, 1));

        let groups = group_matches(&graph, positions, 15.0);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0], (0, Point2::new(15.0, 0.0)));
    }

    #[test]
    fn test_scattered_duplicates_drop_the_group() {
        let mut graph = MatchGraph::new();
        graph.add_match((0, 1), (1, 1));
        graph.add_match((0, 90), (1, 1));
        assert!(group_matches(&graph, positions, 15.0).is_empty());
    }

    #[test]
    fn test_single_frame_component_is_dropped() {
        let mut graph = MatchGraph::new();
        graph.add_match((3, 1), (3, 2));
        assert!(group_matches(&graph, positions, 15.0).is_empty());
    }
}
