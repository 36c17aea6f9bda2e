//! Bidirectional dependency graph.
//!
//! Nodes are plain strings: cache keys, key namespaces such as `config:*`, or
//! resource paths. An edge `dependent → resource` means "when `resource`
//! changes, `dependent` is stale". Edges are stored in both directions so the
//! set of affected nodes is found by walking reverse edges only, in time
//! proportional to what is affected.

use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// dependent → resources it depends on
    forward: HashMap<String, HashSet<String>>,
    /// resource → dependents
    reverse: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` depends on `resource`. Returns false if the
    /// edge already existed.
    pub fn add_dependency(&mut self, dependent: &str, resource: &str) -> bool {
        let added = self
            .forward
            .entry(dependent.to_string())
            .or_default()
            .insert(resource.to_string());
        self.reverse
            .entry(resource.to_string())
            .or_default()
            .insert(dependent.to_string());
        added
    }

    /// Removes a single edge. Returns true if it existed.
    pub fn remove_dependency(&mut self, dependent: &str, resource: &str) -> bool {
        let removed = remove_edge(&mut self.forward, dependent, resource);
        remove_edge(&mut self.reverse, resource, dependent);
        removed
    }

    /// Removes every edge from `dependent` to its resources.
    pub fn remove_dependent(&mut self, dependent: &str) {
        let Some(resources) = self.forward.remove(dependent) else {
            return;
        };
        for resource in resources {
            remove_edge(&mut self.reverse, &resource, dependent);
        }
    }

    pub fn dependencies_of(&self, dependent: &str) -> Vec<String> {
        sorted(self.forward.get(dependent))
    }

    /// Direct dependents of `resource`.
    pub fn dependents_of(&self, resource: &str) -> Vec<String> {
        sorted(self.reverse.get(resource))
    }

    /// Every node that transitively depends on `resource`, in breadth-first
    /// order. `resource` itself is not included; cycles are tolerated.
    pub fn affected_by(&self, resource: &str) -> Vec<String> {
        self.affected_by_any([resource])
    }

    /// Every node that transitively depends on any of `resources`, without
    /// repeats. The resources themselves are not included.
    pub fn affected_by_any<'a>(&'a self, resources: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut queue: VecDeque<&str> = resources.into_iter().collect();
        let mut seen: HashSet<&str> = queue.iter().copied().collect();
        let mut affected = Vec::new();

        while let Some(node) = queue.pop_front() {
            let Some(dependents) = self.reverse.get(node) else {
                continue;
            };
            let mut next: Vec<&str> = dependents.iter().map(String::as_str).collect();
            next.sort_unstable();
            for dependent in next {
                if seen.insert(dependent) {
                    affected.push(dependent.to_string());
                    queue.push_back(dependent);
                }
            }
        }
        affected
    }

    /// True if anything depends on `resource`.
    pub fn has_dependents(&self, resource: &str) -> bool {
        self.reverse.get(resource).is_some_and(|d| !d.is_empty())
    }

    /// All nodes that depend on something.
    pub fn dependents(&self) -> Vec<String> {
        let mut dependents: Vec<String> = self.forward.keys().cloned().collect();
        dependents.sort();
        dependents
    }

    /// All resources that have at least one dependent.
    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.reverse.keys().cloned().collect();
        resources.sort();
        resources
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

fn remove_edge(map: &mut HashMap<String, HashSet<String>>, from: &str, to: &str) -> bool {
    let Some(targets) = map.get_mut(from) else {
        return false;
    };
    let removed = targets.remove(to);
    if targets.is_empty() {
        map.remove(from);
    }
    removed
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut items: Vec<String> = set.into_iter().flatten().cloned().collect();
    items.sort();
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_bidirectional() {
        let mut graph = DependencyGraph::new();
        assert!(graph.add_dependency("key1", "/a.json"));
        assert!(!graph.add_dependency("key1", "/a.json"));
        graph.add_dependency("key2", "/a.json");

        assert_eq!(graph.dependencies_of("key1"), vec!["/a.json"]);
        assert_eq!(graph.dependents_of("/a.json"), vec!["key1", "key2"]);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("config:*", "/settings.json");
        graph.add_dependency("validation:1", "config:*");
        graph.add_dependency("report:1", "validation:1");
        graph.add_dependency("other", "/unrelated.json");

        assert_eq!(
            graph.affected_by("/settings.json"),
            vec!["config:*", "validation:1", "report:1"]
        );
        assert!(graph.affected_by("/nothing").is_empty());
    }

    #[test]
    fn test_affected_by_several_resources() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("dir-key", "/conf");
        graph.add_dependency("file-key", "/conf/a.json");
        graph.add_dependency("both", "/conf");
        graph.add_dependency("both", "/conf/a.json");

        assert_eq!(
            graph.affected_by_any(["/conf/a.json", "/conf"]),
            vec!["both", "file-key", "dir-key"]
        );
        assert_eq!(graph.dependents(), vec!["both", "dir-key", "file-key"]);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "a");
        assert_eq!(graph.affected_by("a"), vec!["b"]);
    }

    #[test]
    fn test_remove_dependent() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("key", "/a");
        graph.add_dependency("key", "/b");
        graph.add_dependency("other", "/a");
        graph.remove_dependent("key");

        assert!(graph.dependencies_of("key").is_empty());
        assert_eq!(graph.dependents_of("/a"), vec!["other"]);
        assert!(!graph.has_dependents("/b"));
        assert_eq!(graph.resources(), vec!["/a"]);
    }

    #[test]
    fn test_remove_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("key", "/a");
        assert!(graph.remove_dependency("key", "/a"));
        assert!(!graph.remove_dependency("key", "/a"));
        assert!(graph.is_empty());
    }
}
