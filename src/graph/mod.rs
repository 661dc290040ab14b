//! A loaded view of the solved package set.
//!
//! Downstream consumers (build tooling, import resolution) need to ask
//! "what does X depend on, directly or transitively?" against the graph the
//! solver chose. Nodes are package *names*; cycles are legal (a package may
//! reach itself back through a dev edge) and never reified as reference
//! cycles; edges point from depender to dependency and lookups resolve
//! names to loaded [`Package`]s on demand.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::package::Package;

/// Adjacency over the loaded members of a solved graph.
#[derive(Debug)]
pub struct PackageGraph {
    root_name: String,
    packages: HashMap<String, Package>,
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl PackageGraph {
    /// Build the graph from the loaded root and every solved member.
    ///
    /// Dependency edges follow each member's pubspec; the root additionally
    /// contributes its dev-dependency edges. Edges to packages outside
    /// `members` (nothing should produce them after a successful solve) are
    /// ignored rather than invented.
    #[must_use]
    pub fn new(root: Package, members: Vec<Package>) -> Self {
        let root_name = root.id.name.clone();
        let mut packages: HashMap<String, Package> =
            members.into_iter().map(|package| (package.id.name.clone(), package)).collect();
        packages.insert(root_name.clone(), root);

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for name in packages.keys() {
            let index = graph.add_node(name.clone());
            indices.insert(name.clone(), index);
        }

        for (name, package) in &packages {
            let from = indices[name];
            let dev_edges =
                if *name == root_name { &package.pubspec.dev_dependencies[..] } else { &[] };
            for dep in package.pubspec.dependencies.iter().chain(dev_edges) {
                if let Some(&to) = indices.get(dep.name()) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self {
            root_name,
            packages,
            graph,
            indices,
        }
    }

    /// The loaded root package.
    #[must_use]
    pub fn root(&self) -> &Package {
        &self.packages[&self.root_name]
    }

    /// Look up a member by name.
    #[must_use]
    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    /// Every member, root included.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// The packages `name` depends on directly, sorted by name.
    #[must_use]
    pub fn direct_dependencies(&self, name: &str) -> Vec<&Package> {
        let Some(&index) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors(index)
            .map(|neighbor| self.graph[neighbor].as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names.iter().filter_map(|name| self.packages.get(*name)).collect()
    }

    /// The transitive dependency closure of `name` (excluding `name` itself
    /// unless a cycle reaches back to it), sorted by name.
    #[must_use]
    pub fn transitive_dependencies(&self, name: &str) -> Vec<&Package> {
        let Some(&start) = self.indices.get(name) else {
            return Vec::new();
        };

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = self.graph.neighbors(start).collect();
        while let Some(index) = stack.pop() {
            if visited.insert(index) {
                stack.extend(self.graph.neighbors(index));
            }
        }

        let mut names: Vec<&str> =
            visited.iter().map(|&index| self.graph[index].as_str()).collect();
        names.sort_unstable();
        names.iter().filter_map(|name| self.packages.get(*name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Dependency, Pubspec};
    use crate::package::{Description, PackageId, PackageRef};
    use crate::version::{Version, VersionConstraint};
    use std::path::PathBuf;
    use url::Url;

    fn pkg(name: &str, deps: &[&str]) -> Package {
        let mut pubspec = Pubspec::empty(name);
        pubspec.version = Some(Version::new(1, 0, 0));
        pubspec.dependencies = deps
            .iter()
            .map(|dep| Dependency {
                target: PackageRef {
                    name: (*dep).to_string(),
                    source: "hosted".into(),
                    description: Description::Hosted {
                        url: Url::parse("https://pub.tavern.dev").unwrap(),
                        name: (*dep).to_string(),
                    },
                },
                constraint: VersionConstraint::any(),
            })
            .collect();
        Package {
            id: PackageId {
                name: name.to_string(),
                source: "hosted".into(),
                version: Version::new(1, 0, 0),
                description: Description::Hosted {
                    url: Url::parse("https://pub.tavern.dev").unwrap(),
                    name: name.to_string(),
                },
            },
            pubspec,
            dir: PathBuf::from("/nowhere"),
        }
    }

    fn root(name: &str, deps: &[&str]) -> Package {
        let mut package = pkg(name, deps);
        package.id = PackageId::root(name, Version::new(0, 0, 0), std::path::Path::new("/proj"));
        package
    }

    #[test]
    fn direct_and_transitive_lookup() {
        let graph = PackageGraph::new(
            root("app", &["a"]),
            vec![pkg("a", &["b"]), pkg("b", &["c"]), pkg("c", &[])],
        );

        let direct: Vec<&str> =
            graph.direct_dependencies("app").iter().map(|p| p.id.name.as_str()).collect();
        assert_eq!(direct, ["a"]);

        let transitive: Vec<&str> =
            graph.transitive_dependencies("app").iter().map(|p| p.id.name.as_str()).collect();
        assert_eq!(transitive, ["a", "b", "c"]);
    }

    #[test]
    fn cycles_terminate() {
        let graph =
            PackageGraph::new(root("app", &["a"]), vec![pkg("a", &["b"]), pkg("b", &["a"])]);

        let transitive: Vec<&str> =
            graph.transitive_dependencies("a").iter().map(|p| p.id.name.as_str()).collect();
        // b leads back to a; traversal visits each node once.
        assert_eq!(transitive, ["a", "b"]);
    }
}
