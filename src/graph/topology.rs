//! Graph algorithms over the node registry: topological ordering, cycle
//! enumeration, structural validation, and dependency traversal.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{ModelError, Result};
use crate::graph::registry::NodeRegistry;

/// Full adjacency snapshot: node name to the names of its direct inputs.
/// A node whose introspection yields nothing defaults to an empty list.
pub(crate) fn dependency_graph(registry: &NodeRegistry) -> BTreeMap<String, Vec<String>> {
    registry
        .iter()
        .map(|node| (node.name().to_string(), node.dependencies()))
        .collect()
}

/// Topological sort via Kahn's algorithm. Edges point input -> dependent;
/// the result lists every node after all of its direct inputs. Tie-break
/// among ready nodes follows insertion order, for determinism only.
pub(crate) fn topological_sort(registry: &NodeRegistry) -> Result<Vec<String>> {
    // Dangling inputs are a validation concern, not a sort concern: edges to
    // names absent from the registry are ignored here.
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(registry.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in registry.iter() {
        in_degree.entry(node.name()).or_insert(0);
    }
    for node in registry.iter() {
        for input in node.dependencies() {
            if let Some((input_key, _)) = in_degree.get_key_value(input.as_str()) {
                let input_key = *input_key;
                *in_degree.get_mut(node.name()).unwrap() += 1;
                dependents.entry(input_key).or_default().push(node.name());
            }
        }
    }

    let mut queue: VecDeque<&str> = registry
        .names()
        .filter(|name| in_degree[name] == 0)
        .collect();
    let mut order = Vec::with_capacity(registry.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(children) = dependents.get(name) {
            for &child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() != registry.len() {
        let path = detect_cycles(registry).into_iter().next().unwrap_or_default();
        return Err(ModelError::CircularDependency { path });
    }

    Ok(order)
}

/// Enumerates every distinct dependency cycle via DFS back-edge detection.
/// Each cycle is the sequence of node names forming the loop, first name
/// repeated at the end; degenerate self-loops are included.
pub(crate) fn detect_cycles(registry: &NodeRegistry) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum VisitState {
        None,
        Visiting,
        Visited,
    }

    fn visit(
        registry: &NodeRegistry,
        name: &str,
        state: &mut HashMap<String, VisitState>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        match state.get(name).copied().unwrap_or(VisitState::None) {
            VisitState::Visited => return,
            VisitState::Visiting => {
                // Back edge: the loop runs from the stack's first occurrence
                // of `name` through the current top.
                if let Some(start) = stack.iter().position(|n| n == name) {
                    let mut cycle: Vec<String> = stack[start..].to_vec();
                    cycle.push(name.to_string());
                    cycles.push(cycle);
                }
                return;
            }
            VisitState::None => {}
        }

        state.insert(name.to_string(), VisitState::Visiting);
        stack.push(name.to_string());

        if let Some(node) = registry.get(name) {
            for input in node.dependencies() {
                if registry.contains(&input) {
                    visit(registry, &input, state, stack, cycles);
                }
            }
        }

        stack.pop();
        state.insert(name.to_string(), VisitState::Visited);
    }

    let mut state = HashMap::new();
    let mut cycles = Vec::new();
    let names: Vec<String> = registry.names().map(str::to_string).collect();
    for name in &names {
        let mut stack = Vec::new();
        visit(registry, name, &mut state, &mut stack, &mut cycles);
    }
    cycles
}

/// One message per detected cycle plus one per dangling input reference.
/// An empty list means the graph is well-formed.
pub(crate) fn validate(registry: &NodeRegistry) -> Vec<String> {
    let mut problems = Vec::new();

    for cycle in detect_cycles(registry) {
        problems.push(format!("circular dependency: {}", cycle.join(" -> ")));
    }

    for node in registry.iter() {
        for input in node.dependencies() {
            if !registry.contains(&input) {
                problems.push(format!(
                    "node '{}' references missing node '{input}'",
                    node.name()
                ));
            }
        }
    }

    problems
}

/// Every node downstream of `start` (dependents, transitively), including
/// `start` itself. Used for selective cache invalidation.
pub(crate) fn dependents_closure(registry: &NodeRegistry, start: &str) -> HashSet<String> {
    // Reverse adjacency: input name -> dependent names.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let dep_lists: Vec<(&str, Vec<String>)> = registry
        .iter()
        .map(|node| (node.name(), node.dependencies()))
        .collect();
    for (name, deps) in &dep_lists {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name);
        }
    }

    let mut closure = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        if closure.insert(current.clone()) {
            if let Some(children) = dependents.get(current.as_str()) {
                for &child in children {
                    queue.push_back(child.to_string());
                }
            }
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, Strategy};
    use std::collections::BTreeMap;

    fn item(name: &str) -> Node {
        Node::item(name, BTreeMap::new())
    }

    fn sum(name: &str, inputs: &[&str]) -> Node {
        Node::Calculation {
            name: name.into(),
            inputs: inputs.iter().map(|i| i.to_string()).collect(),
            strategy: Strategy::Addition,
            description: None,
        }
    }

    #[test]
    fn test_sort_diamond_dependency() {
        // Shape: A -> B, A -> C, B+C -> D
        let mut registry = NodeRegistry::new();
        registry.insert(item("A"));
        registry.insert(sum("B", &["A"]));
        registry.insert(sum("C", &["A"]));
        registry.insert(sum("D", &["B", "C"]));

        let order = topological_sort(&registry).expect("sort failed");
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[test]
    fn test_two_node_cycle_round_trip() {
        let mut registry = NodeRegistry::new();
        registry.insert(sum("A", &["B"]));
        registry.insert(sum("B", &["A"]));

        let cycles = detect_cycles(&registry);
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"A".to_string()) && cycle.contains(&"B".to_string()));

        match topological_sort(&registry) {
            Err(ModelError::CircularDependency { path }) => assert!(!path.is_empty()),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_detected() {
        let mut registry = NodeRegistry::new();
        registry.insert(sum("A", &["A"]));
        let cycles = detect_cycles(&registry);
        assert_eq!(cycles, vec![vec!["A".to_string(), "A".to_string()]]);
    }

    #[test]
    fn test_validate_reports_dangling_references() {
        let mut registry = NodeRegistry::new();
        registry.insert(sum("B", &["ghost"]));
        let problems = validate(&registry);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("ghost"), "{problems:?}");
    }

    #[test]
    fn test_validate_clean_graph_is_empty() {
        let mut registry = NodeRegistry::new();
        registry.insert(item("A"));
        registry.insert(sum("B", &["A"]));
        assert!(validate(&registry).is_empty());
    }

    #[test]
    fn test_dependents_closure() {
        let mut registry = NodeRegistry::new();
        registry.insert(item("A"));
        registry.insert(sum("B", &["A"]));
        registry.insert(sum("C", &["B"]));
        registry.insert(item("unrelated"));

        let closure = dependents_closure(&registry, "A");
        assert_eq!(closure.len(), 3);
        assert!(closure.contains("A") && closure.contains("B") && closure.contains("C"));
        assert!(!closure.contains("unrelated"));
    }

    #[test]
    fn test_dangling_reference_does_not_break_sort() {
        let mut registry = NodeRegistry::new();
        registry.insert(sum("B", &["ghost"]));
        // Sorting still succeeds; validate() is where the dangling ref lands.
        assert_eq!(topological_sort(&registry).unwrap(), vec!["B".to_string()]);
    }
}
