//! Module dependency ordering.

use std::collections::{BTreeMap, BTreeSet};

use super::{Result, Schema, SchemaError};

/// Order modules into dependency levels.
///
/// Every module appears after all modules it imports. Modules within a level
/// are sorted by name. Fails with `CycleDetected` naming the strongly
/// connected component when imports form a cycle.
pub fn topological_sort(schema: &Schema) -> Result<Vec<Vec<String>>> {
    let names: BTreeSet<&str> = schema.modules.iter().map(|m| m.name.as_str()).collect();

    // module -> modules it imports (restricted to modules in the schema)
    let mut imports: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for module in &schema.modules {
        let deps = module
            .imports()
            .into_iter()
            .filter(|dep| names.contains(dep.as_str()))
            .collect();
        imports.insert(module.name.clone(), deps);
    }

    let mut remaining = imports.clone();
    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            return Err(SchemaError::CycleDetected {
                participants: find_cycle(&remaining),
            });
        }
        for name in &ready {
            remaining.remove(name);
        }
        for deps in remaining.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }
        levels.push(ready);
    }
    Ok(levels)
}

/// The first strongly connected component that forms a cycle, sorted by name.
fn find_cycle(graph: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut tarjan = Tarjan {
        graph,
        index: 0,
        indices: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        components: Vec::new(),
    };
    for node in graph.keys() {
        if !tarjan.indices.contains_key(node.as_str()) {
            tarjan.connect(node);
        }
    }

    let mut cyclic: Vec<Vec<String>> = tarjan
        .components
        .into_iter()
        .filter(|c| c.len() > 1)
        .map(|mut c| {
            c.sort();
            c
        })
        .collect();
    cyclic.sort();
    cyclic.into_iter().next().unwrap_or_default()
}

struct Tarjan<'g> {
    graph: &'g BTreeMap<String, BTreeSet<String>>,
    index: usize,
    indices: BTreeMap<&'g str, usize>,
    lowlink: BTreeMap<&'g str, usize>,
    stack: Vec<&'g str>,
    on_stack: BTreeSet<&'g str>,
    components: Vec<Vec<String>>,
}

impl<'g> Tarjan<'g> {
    fn connect(&mut self, node: &'g str) {
        self.indices.insert(node, self.index);
        self.lowlink.insert(node, self.index);
        self.index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        if let Some(edges) = self.graph.get(node) {
            for next in edges {
                let next = next.as_str();
                if !self.graph.contains_key(next) {
                    continue;
                }
                if !self.indices.contains_key(next) {
                    self.connect(next);
                    let low = self.lowlink[node].min(self.lowlink[next]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.lowlink[node].min(self.indices[next]);
                    self.lowlink.insert(node, low);
                }
            }
        }

        if self.lowlink[node] == self.indices[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member.to_string());
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
