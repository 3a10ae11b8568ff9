//! Dependency graph construction
//!
//! Turns declared `DependsOn` references into a directed graph over
//! concrete descriptors, rejecting unresolved references and cycles before
//! anything is scheduled.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::models::{TestDescriptor, TestId, TestRef};

/// One resolved dependency edge, pointing at a predecessor node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    pub predecessor: usize,
    /// Soft edge: the dependent runs regardless of the predecessor outcome.
    pub proceed_on_failure: bool,
}

/// A descriptor plus its resolved neighborhood.
#[derive(Clone, Debug)]
pub struct GraphNode {
    pub descriptor: Arc<TestDescriptor>,
    pub predecessors: Vec<DependencyEdge>,
    pub successors: Vec<usize>,
}

/// Validated, acyclic dependency graph in discovery order.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<TestId, usize>,
}

impl ExecutionGraph {
    /// Resolve references, reject duplicates, self-references, cycles and
    /// serial-lane orderings that contradict a dependency edge.
    pub fn build(descriptors: Vec<TestDescriptor>) -> Result<Self, DiscoveryError> {
        let mut nodes: Vec<GraphNode> = descriptors
            .into_iter()
            .map(|descriptor| GraphNode {
                descriptor: Arc::new(descriptor),
                predecessors: Vec::new(),
                successors: Vec::new(),
            })
            .collect();

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.descriptor.id.clone(), i).is_some() {
                return Err(DiscoveryError::DuplicateTestId(
                    node.descriptor.id.as_str().to_string(),
                ));
            }
        }

        // Resolve every declared reference to concrete node indices.
        let mut resolved_edges: Vec<Vec<DependencyEdge>> = vec![Vec::new(); nodes.len()];
        for i in 0..nodes.len() {
            let descriptor = nodes[i].descriptor.clone();
            for dependency in &descriptor.depends_on {
                let matches = Self::resolve_reference(&nodes, i, &dependency.target)?;
                for target in matches {
                    let edges = &mut resolved_edges[i];
                    match edges.iter_mut().find(|e| e.predecessor == target) {
                        Some(existing) => {
                            // Hard wins when the same pair is declared twice.
                            existing.proceed_on_failure &= dependency.proceed_on_failure;
                        }
                        None => edges.push(DependencyEdge {
                            predecessor: target,
                            proceed_on_failure: dependency.proceed_on_failure,
                        }),
                    }
                }
            }
        }

        for (i, edges) in resolved_edges.into_iter().enumerate() {
            for edge in &edges {
                nodes[edge.predecessor].successors.push(i);
            }
            nodes[i].predecessors = edges;
        }

        let graph = Self { nodes, index };
        if let Some(cycle) = graph.find_cycle() {
            let path = cycle
                .iter()
                .map(|&i| graph.nodes[i].descriptor.id.as_str().to_string())
                .collect();
            return Err(DiscoveryError::DependencyCycle { path });
        }
        if let Some(conflict) = graph.lane_conflict() {
            return Err(conflict);
        }

        debug!(
            tests = graph.nodes.len(),
            roots = graph.roots().len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// All node indices a reference resolves to. A `Class::method` name
    /// matches each argument instance of that method; a bare class name
    /// matches every test in the class (excluding the referrer itself, as
    /// class-level dependencies mean "the rest of the class").
    fn resolve_reference(
        nodes: &[GraphNode],
        referrer: usize,
        reference: &TestRef,
    ) -> Result<Vec<usize>, DiscoveryError> {
        let arg_matches = |node: &GraphNode| match &reference.arg_signature {
            Some(sig) => node.descriptor.argument_display.as_deref() == Some(sig.as_str()),
            None => true,
        };

        let mut matches: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.descriptor.qualified_name() == reference.qualified_name && arg_matches(node)
            })
            .map(|(i, _)| i)
            .collect();

        let mut was_class_level = false;
        if matches.is_empty() {
            was_class_level = true;
            matches = nodes
                .iter()
                .enumerate()
                .filter(|(i, node)| {
                    *i != referrer
                        && node.descriptor.class.name == reference.qualified_name
                        && arg_matches(node)
                })
                .map(|(i, _)| i)
                .collect();
        }

        if matches.is_empty() {
            return Err(DiscoveryError::UnresolvedDependency {
                test: nodes[referrer].descriptor.id.as_str().to_string(),
                reference: reference.to_string(),
            });
        }

        if !was_class_level {
            let before = matches.len();
            matches.retain(|&i| i != referrer);
            if before != matches.len() && matches.is_empty() {
                return Err(DiscoveryError::SelfDependency {
                    test: nodes[referrer].descriptor.id.as_str().to_string(),
                });
            }
        }

        Ok(matches)
    }

    fn find_cycle(&self) -> Option<Vec<usize>> {
        let preds: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .map(|node| node.predecessors.iter().map(|e| e.predecessor).collect())
            .collect();
        Self::find_cycle_in(&preds)
    }

    /// Lane members run strictly in declared order, so each member waits for
    /// the one ahead of it. A dependency edge pointing the other way can
    /// never be satisfied and would stall the lane forever, so it is
    /// rejected here. The dependency graph alone is already known acyclic,
    /// which means any cycle in the union crosses a lane edge.
    fn lane_conflict(&self) -> Option<DiscoveryError> {
        let mut lanes: HashMap<&str, Vec<(i32, usize)>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let constraint = &node.descriptor.parallel;
            if let Some(key) = constraint.lane_key() {
                lanes
                    .entry(key)
                    .or_default()
                    .push((constraint.lane_order(), i));
            }
        }

        // lane_pred[later] = (earlier, key) for consecutive lane members.
        let mut lane_pred: HashMap<usize, (usize, &str)> = HashMap::new();
        for (key, members) in lanes.iter_mut() {
            members.sort();
            for pair in members.windows(2) {
                lane_pred.insert(pair[1].1, (pair[0].1, *key));
            }
        }
        if lane_pred.is_empty() {
            return None;
        }

        let preds: Vec<Vec<usize>> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mut preds: Vec<usize> =
                    node.predecessors.iter().map(|e| e.predecessor).collect();
                if let Some(&(earlier, _)) = lane_pred.get(&i) {
                    preds.push(earlier);
                }
                preds
            })
            .collect();

        let cycle = Self::find_cycle_in(&preds)?;
        for pair in cycle.windows(2) {
            if let Some(&(earlier, key)) = lane_pred.get(&pair[0]) {
                if earlier == pair[1] {
                    return Some(DiscoveryError::SerialOrderConflict {
                        key: key.to_string(),
                        test: self.nodes[pair[0]].descriptor.id.as_str().to_string(),
                        blocker: self.nodes[pair[1]].descriptor.id.as_str().to_string(),
                    });
                }
            }
        }
        let path = cycle
            .iter()
            .map(|&i| self.nodes[i].descriptor.id.as_str().to_string())
            .collect();
        Some(DiscoveryError::DependencyCycle { path })
    }

    /// Depth-first search over a predecessor relation with an explicit
    /// recursion stack; returns the full cycle path (first node repeated at
    /// the end).
    fn find_cycle_in(preds: &[Vec<usize>]) -> Option<Vec<usize>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let mut color = vec![WHITE; preds.len()];
        let mut path: Vec<usize> = Vec::new();

        for start in 0..preds.len() {
            if color[start] != WHITE {
                continue;
            }

            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = GRAY;
            path.push(start);

            while let Some(&(node, edge)) = stack.last() {
                if edge < preds[node].len() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    let next = preds[node][edge];

                    match color[next] {
                        WHITE => {
                            color[next] = GRAY;
                            path.push(next);
                            stack.push((next, 0));
                        }
                        GRAY => {
                            let from = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<usize> = path[from..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        _ => {}
                    }
                } else {
                    color[node] = BLACK;
                    path.pop();
                    stack.pop();
                }
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn index_of(&self, id: &TestId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Nodes with no predecessors, in discovery order.
    pub fn roots(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.predecessors.is_empty())
            .map(|(i, _)| i)
            .collect()
    }
}
