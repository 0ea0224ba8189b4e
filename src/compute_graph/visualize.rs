use std::collections::HashSet;

use tabbycat::{Edge, GraphBuilder, GraphType, Identity, Stmt, StmtList};

use crate::array::{NodeId, StridedArray};

/// The lazy graph behind `root` as a DOT digraph. Materialized operands appear as
/// leaves.
pub(crate) fn graphviz(root: &StridedArray) -> String {
    let mut statements = Vec::new();
    add_node_to_graph(&mut statements, root, &mut HashSet::new());
    GraphBuilder::default()
        .graph_type(GraphType::DiGraph)
        .strict(false)
        .id(Identity::quoted("ComputeGraph"))
        .stmts(StmtList::new().extend(statements))
        .build()
        .map(|graph| graph.to_string())
        .unwrap_or_default()
}

fn node_name(node: &StridedArray) -> String {
    let label = match node.descriptor() {
        Some(descriptor) if node.is_lazy() => descriptor.label(),
        _ => match node.constant_value() {
            Some(value) => format!("constant {value}"),
            None => "buffer".to_string(),
        },
    };
    format!("{label} {} ({})", node.id(), node.layout())
}

fn add_node_to_graph(
    graph: &mut Vec<Stmt>,
    node: &StridedArray,
    visited: &mut HashSet<NodeId>,
) -> String {
    let name = node_name(node);
    if !visited.insert(node.id()) {
        return name;
    }
    graph.push(Stmt::Node {
        id: Identity::quoted(name.clone()),
        port: None,
        attr: None,
    });
    if !node.is_lazy() {
        return name;
    }
    if let Some(descriptor) = node.descriptor() {
        for operand in &descriptor.operands {
            let input = add_node_to_graph(graph, operand, visited);
            graph.push(Stmt::Edge(
                Edge::head_node(Identity::quoted(input), None)
                    .arrow_to_node(Identity::quoted(name.clone()), None),
            ));
        }
    }
    name
}
