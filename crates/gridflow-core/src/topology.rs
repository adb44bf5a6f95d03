//! Topological analysis of the external network graph.
//!
//! Island labelling here works on the raw graph (every edge, regardless of
//! in-service flags) and is meant for inspection and reporting. The solver
//! maintains its own connectivity over enabled edges only.

use crate::{Edge, Network};
use anyhow::{anyhow, Result};
use petgraph::visit::EdgeRef;
use std::collections::{HashSet, VecDeque};

/// Island summary for reporting.
#[derive(Debug)]
pub struct IslandSummary {
    pub island_id: usize,
    pub node_count: usize,
}

/// Node-to-island assignment.
#[derive(Debug)]
pub struct NodeAssignment {
    pub node_index: usize,
    pub label: String,
    pub island_id: usize,
}

/// Aggregated island analysis result.
#[derive(Debug)]
pub struct IslandAnalysis {
    pub islands: Vec<IslandSummary>,
    pub assignments: Vec<NodeAssignment>,
}

/// Labels connected components (breadth-first search) with island metadata.
pub fn find_islands(network: &Network) -> Result<IslandAnalysis> {
    let mut visited = HashSet::new();
    let mut islands = Vec::new();
    let mut assignments = Vec::new();
    let mut island_id = 0;
    for start in network.graph.node_indices() {
        if visited.contains(&start) {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut members = Vec::new();
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            members.push(node);
            for neighbor in network.graph.neighbors(node) {
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        if members.is_empty() {
            continue;
        }
        islands.push(IslandSummary {
            island_id,
            node_count: members.len(),
        });
        for node in members {
            assignments.push(NodeAssignment {
                node_index: node.index(),
                label: network.graph[node].label().to_string(),
                island_id,
            });
        }
        island_id += 1;
    }
    assignments.sort_by_key(|assignment| assignment.node_index);
    Ok(IslandAnalysis {
        islands,
        assignments,
    })
}

/// Export the topology to a graph-description string for offline viewing.
pub fn export_graph(network: &Network, format: &str) -> Result<String> {
    match format.to_ascii_lowercase().as_str() {
        "graphviz" | "dot" => Ok(render_dot(network)),
        other => Err(anyhow!("unsupported graph export format '{other}'")),
    }
}

fn render_dot(network: &Network) -> String {
    let mut buffer = String::new();
    buffer.push_str("graph gridflow_network {\n");
    for node in network.graph.node_indices() {
        let label = sanitize_label(network.graph[node].label());
        buffer.push_str(&format!("  n{} [label=\"{}\"];\n", node.index(), label));
    }
    for edge in network.graph.edge_references() {
        let source = edge.source().index();
        let target = edge.target().index();
        let Edge::Branch(branch) = edge.weight();
        let style = if branch.is_connected() { "" } else { " [style=dashed]" };
        buffer.push_str(&format!("  n{source} -- n{target}{style};\n"));
    }
    buffer.push('}');
    buffer
}

fn sanitize_label(label: &str) -> String {
    label.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Branch, BranchId, Bus, BusId, Edge, Node};

    fn network_with_two_islands() -> Network {
        let mut network = Network::new();
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "A".to_string(),
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "B".to_string(),
            ..Bus::default()
        }));
        network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(3),
            name: "C".to_string(),
            ..Bus::default()
        }));
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "A-B".to_string(),
                BusId::new(1),
                BusId::new(2),
                0.01,
                0.1,
            )),
        );
        network
    }

    #[test]
    fn test_find_islands() {
        let network = network_with_two_islands();
        let analysis = find_islands(&network).unwrap();
        assert_eq!(analysis.islands.len(), 2);
        assert_eq!(analysis.assignments.len(), 3);
        let counts: Vec<usize> = analysis.islands.iter().map(|i| i.node_count).collect();
        assert!(counts.contains(&2));
        assert!(counts.contains(&1));
    }

    #[test]
    fn test_dot_export() {
        let network = network_with_two_islands();
        let dot = export_graph(&network, "dot").unwrap();
        assert!(dot.starts_with("graph gridflow_network {"));
        assert!(dot.contains("n0 -- n1"));
        assert!(export_graph(&network, "gexf").is_err());
    }
}
