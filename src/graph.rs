use crate::prelude::*;

// The output graph can mention the same (name, version, extras) triple many
// times (once per requiring parent), and only the per-edge ancestor guard
// keeps it acyclic, so back-edges must not create ownership cycles. Choices
// therefore live in an arena and edges refer to them by index.

pub type ChoiceIdx = usize;

/// Identity for dedup purposes: two choices render as "the same thing"
/// exactly when their keys match.
pub type ChoiceKey = (PackageName, Version, Vec<Extra>);

/// A selected version of a project, as a node in the output graph.
#[derive(Debug)]
pub struct Choice {
    pub name: PackageName,
    pub version: Version,
    pub extras: Vec<Extra>,
    pub has_sdist: bool,
    pub has_wheel: bool,
    pub deps: Vec<Edge>,
}

impl Choice {
    pub fn key(&self) -> ChoiceKey {
        (self.name.clone(), self.version.clone(), self.extras.clone())
    }
}

/// A labeled arc from a requiring choice to the choice satisfying it.
#[derive(Debug)]
pub struct Edge {
    pub target: ChoiceIdx,
    pub specifiers: Specifiers,
    pub marker: Option<marker::Expr>,
    /// Where the requirement came from: "arg", "dep", "pin", or a
    /// requirements-file path.
    pub note: String,
}

#[derive(Debug)]
pub struct DepGraph {
    choices: Vec<Choice>,
    root: ChoiceIdx,
}

impl DepGraph {
    pub fn new() -> DepGraph {
        let root = Choice {
            name: PackageName::root_sentinel(),
            version: "0".parse().unwrap(),
            extras: Vec::new(),
            has_sdist: false,
            has_wheel: false,
            deps: Vec::new(),
        };
        DepGraph {
            choices: vec![root],
            root: 0,
        }
    }

    pub fn root(&self) -> ChoiceIdx {
        self.root
    }

    pub fn add_choice(
        &mut self,
        name: PackageName,
        version: Version,
        extras: Vec<Extra>,
    ) -> ChoiceIdx {
        self.choices.push(Choice {
            name,
            version,
            extras,
            has_sdist: false,
            has_wheel: false,
            deps: Vec::new(),
        });
        self.choices.len() - 1
    }

    pub fn add_edge(&mut self, parent: ChoiceIdx, edge: Edge) {
        self.choices[parent].deps.push(edge);
    }

    pub fn choice(&self, idx: ChoiceIdx) -> &Choice {
        &self.choices[idx]
    }

    pub fn choice_mut(&mut self, idx: ChoiceIdx) -> &mut Choice {
        &mut self.choices[idx]
    }
}

impl Default for DepGraph {
    fn default() -> Self {
        DepGraph::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_graph_basics() {
        let mut graph = DepGraph::new();
        let root = graph.root();
        assert_eq!(graph.choice(root).name.normalized(), "-");
        assert_eq!(graph.choice(root).version.to_string(), "0");

        let a = graph.add_choice(
            "alpha".parse().unwrap(),
            "1.0".parse().unwrap(),
            Vec::new(),
        );
        graph.add_edge(
            root,
            Edge {
                target: a,
                specifiers: Specifiers::any(),
                marker: None,
                note: "arg".into(),
            },
        );
        graph.choice_mut(a).has_wheel = true;

        assert_eq!(graph.choice(root).deps.len(), 1);
        let edge = &graph.choice(root).deps[0];
        assert_eq!(edge.target, a);
        assert!(graph.choice(edge.target).has_wheel);
    }

    #[test]
    fn test_choice_key_includes_extras() {
        let mut graph = DepGraph::new();
        let plain = graph.add_choice(
            "pkg".parse().unwrap(),
            "1.0".parse().unwrap(),
            Vec::new(),
        );
        let with_extra = graph.add_choice(
            "pkg".parse().unwrap(),
            "1.0".parse().unwrap(),
            vec!["fancy".parse().unwrap()],
        );
        assert_ne!(graph.choice(plain).key(), graph.choice(with_extra).key());
    }
}
