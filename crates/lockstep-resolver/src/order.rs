use std::collections::{BTreeMap, BTreeSet};

use lockstep_core::DependencyGraph;
use tracing::debug;

/// Names of the graph, each after the packages it depends on. Members of a
/// dependency cycle have no such order; they follow everything else, sorted
/// by name.
pub fn install_order(graph: &DependencyGraph) -> Vec<String> {
    let names = graph.names();
    let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut in_degree: BTreeMap<String, usize> = BTreeMap::new();

    for name in &names {
        reverse.insert(name.clone(), BTreeSet::new());
        in_degree.insert(name.clone(), 0);
    }

    for spec in graph.iter() {
        let dependencies = spec
            .dependencies
            .iter()
            .filter(|dep| dep.name != spec.name && names.contains(&dep.name))
            .map(|dep| dep.name.clone())
            .collect::<BTreeSet<_>>();
        for dep_name in &dependencies {
            if reverse
                .entry(dep_name.clone())
                .or_default()
                .insert(spec.name.clone())
            {
                *in_degree.entry(spec.name.clone()).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter_map(|(name, degree)| (*degree == 0).then_some(name.clone()))
        .collect();
    let mut ordered = Vec::with_capacity(names.len());

    while let Some(next) = ready.pop_first() {
        ordered.push(next.clone());
        if let Some(children) = reverse.get(&next) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(child.clone());
                    }
                }
            }
        }
    }

    if ordered.len() != names.len() {
        let placed: BTreeSet<String> = ordered.iter().cloned().collect();
        let cycle_nodes = names.difference(&placed).cloned().collect::<Vec<_>>();
        debug!(packages = %cycle_nodes.join(", "), "dependency cycle");
        ordered.extend(cycle_nodes);
    }

    ordered
}
