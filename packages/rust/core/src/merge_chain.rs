//! Merge-chain resolution.
//!
//! A `MERGE_WITH:<name>` decision points at another mention of the run,
//! which may itself be merged into a third. Each chain is walked to its
//! terminal decision with an explicit visited set; resolved terminals are
//! cached for every mention on the walked path.

use std::collections::{HashMap, HashSet};

use docgraph_shared::{DocGraphError, Result};

const CREATE_NEW: &str = "CREATE_NEW";
const MERGE_WITH: &str = "MERGE_WITH:";

/// A parsed resolution decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    CreateNew,
    MergeWith(String),
    /// Link to an already persisted entity id.
    Link(String),
    Unparseable(String),
}

impl Decision {
    /// Parse a decision string. Anything that is neither `CREATE_NEW`,
    /// `MERGE_WITH:<name>` nor a single whitespace-free token is unparseable.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(CREATE_NEW) {
            return Self::CreateNew;
        }
        if trimmed
            .get(..MERGE_WITH.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(MERGE_WITH))
        {
            let target = trimmed[MERGE_WITH.len()..].trim();
            return if target.is_empty() {
                Self::Unparseable(raw.to_string())
            } else {
                Self::MergeWith(target.to_string())
            };
        }
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) || trimmed.contains(':') {
            return Self::Unparseable(raw.to_string());
        }
        Self::Link(trimmed.to_string())
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Self::MergeWith(_))
    }
}

/// One mention's decision, as input to the chain walk.
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub cluster_id: i64,
    pub entity_name: String,
    pub canonical_name: String,
    pub decision: Decision,
}

/// Where a mention's chain ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Created by the node at this position.
    Create(usize),
    /// Linked to a persisted entity id.
    Link(String),
    Unresolved(String),
}

/// Name index over one run's decisions.
pub struct MergeChains<'a> {
    nodes: &'a [ChainNode],
    by_cluster: HashMap<(i64, String), Vec<usize>>,
    by_name: HashMap<String, Vec<usize>>,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl<'a> MergeChains<'a> {
    pub fn new(nodes: &'a [ChainNode]) -> Self {
        let mut by_cluster: HashMap<(i64, String), Vec<usize>> = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();

        // Entity-name matches rank ahead of canonical-name matches.
        let names = nodes.iter().enumerate().map(|(i, n)| (i, &n.entity_name));
        let canonical = nodes.iter().enumerate().map(|(i, n)| (i, &n.canonical_name));
        for (i, name) in names.chain(canonical) {
            let key = name_key(name);
            if key.is_empty() {
                continue;
            }
            let slot = by_cluster.entry((nodes[i].cluster_id, key.clone())).or_default();
            if !slot.contains(&i) {
                slot.push(i);
            }
            let slot = by_name.entry(key).or_default();
            if !slot.contains(&i) {
                slot.push(i);
            }
        }

        Self {
            nodes,
            by_cluster,
            by_name,
        }
    }

    /// The mention a `MERGE_WITH:<name>` from `from` points at: same cluster
    /// first, then anywhere in the run. Never `from` itself.
    fn target(&self, from: usize, name: &str) -> Option<usize> {
        let key = name_key(name);
        let local = self.by_cluster.get(&(self.nodes[from].cluster_id, key.clone()));
        let global = self.by_name.get(&key);
        local
            .into_iter()
            .chain(global)
            .flatten()
            .copied()
            .find(|&candidate| candidate != from)
    }

    /// Resolve every node to its terminal, in node order.
    ///
    /// A cycle is an error; unparseable decisions and missing targets make
    /// the whole chain unresolved.
    pub fn resolve(&self) -> Result<Vec<Terminal>> {
        let mut resolved: Vec<Option<Terminal>> = vec![None; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if resolved[start].is_some() {
                continue;
            }

            let mut path = vec![start];
            let mut visited: HashSet<usize> = HashSet::from([start]);
            let mut current = start;

            let terminal = loop {
                match &self.nodes[current].decision {
                    Decision::CreateNew => break Terminal::Create(current),
                    Decision::Link(id) => break Terminal::Link(id.clone()),
                    Decision::Unparseable(raw) => {
                        break Terminal::Unresolved(format!("unparseable decision '{raw}'"));
                    }
                    Decision::MergeWith(name) => {
                        let Some(next) = self.target(current, name) else {
                            break Terminal::Unresolved(format!("merge target '{name}' not found"));
                        };
                        if let Some(known) = &resolved[next] {
                            break known.clone();
                        }
                        if !visited.insert(next) {
                            let cycle_start = path.iter().position(|&p| p == next).unwrap_or(0);
                            let mut chain: Vec<String> = path[cycle_start..]
                                .iter()
                                .map(|&p| self.nodes[p].entity_name.clone())
                                .collect();
                            chain.push(self.nodes[next].entity_name.clone());
                            return Err(DocGraphError::CyclicMergeChain {
                                cluster_id: self.nodes[next].cluster_id,
                                chain,
                            });
                        }
                        path.push(next);
                        current = next;
                    }
                }
            };

            for node in path {
                resolved[node] = Some(terminal.clone());
            }
        }

        Ok(resolved
            .into_iter()
            .map(|t| t.unwrap_or_else(|| Terminal::Unresolved("not visited".into())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cluster_id: i64, name: &str, decision: &str) -> ChainNode {
        ChainNode {
            cluster_id,
            entity_name: name.into(),
            canonical_name: name.into(),
            decision: Decision::parse(decision),
        }
    }

    #[test]
    fn parses_decisions() {
        assert_eq!(Decision::parse("CREATE_NEW"), Decision::CreateNew);
        assert_eq!(Decision::parse(" create_new "), Decision::CreateNew);
        assert_eq!(
            Decision::parse("MERGE_WITH: React"),
            Decision::MergeWith("React".into())
        );
        assert_eq!(
            Decision::parse("0192f3c4-7d1e-7000-8000-000000000001"),
            Decision::Link("0192f3c4-7d1e-7000-8000-000000000001".into())
        );
        assert!(matches!(Decision::parse(""), Decision::Unparseable(_)));
        assert!(matches!(Decision::parse("MERGE_WITH:"), Decision::Unparseable(_)));
        assert!(matches!(Decision::parse("merge these please"), Decision::Unparseable(_)));
        assert!(matches!(Decision::parse("LINK:abc"), Decision::Unparseable(_)));
    }

    #[test]
    fn chain_resolves_to_root() {
        let nodes = vec![
            node(0, "A", "CREATE_NEW"),
            node(0, "B", "MERGE_WITH:A"),
            node(0, "C", "MERGE_WITH:B"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals, vec![Terminal::Create(0); 3]);
    }

    #[test]
    fn chain_order_does_not_matter() {
        let nodes = vec![
            node(0, "C3", "MERGE_WITH:C2"),
            node(0, "C2", "MERGE_WITH:C1"),
            node(0, "C1", "CREATE_NEW"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals, vec![Terminal::Create(2); 3]);
    }

    #[test]
    fn cycle_is_a_typed_error() {
        let nodes = vec![node(4, "A", "MERGE_WITH:B"), node(4, "B", "MERGE_WITH:A")];
        let err = MergeChains::new(&nodes).resolve().unwrap_err();
        match err {
            DocGraphError::CyclicMergeChain { cluster_id, chain } => {
                assert_eq!(cluster_id, 4);
                assert_eq!(chain, vec!["A", "B", "A"]);
            }
            other => panic!("expected cyclic merge chain, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_root_poisons_the_chain() {
        let nodes = vec![
            node(0, "A", "¯\\_(ツ)_/¯ maybe"),
            node(0, "B", "MERGE_WITH:A"),
            node(0, "C", "CREATE_NEW"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert!(matches!(terminals[0], Terminal::Unresolved(_)));
        assert!(matches!(terminals[1], Terminal::Unresolved(_)));
        assert_eq!(terminals[2], Terminal::Create(2));
    }

    #[test]
    fn missing_target_is_unresolved() {
        let nodes = vec![node(0, "A", "MERGE_WITH:Nowhere")];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert!(matches!(&terminals[0], Terminal::Unresolved(r) if r.contains("Nowhere")));
    }

    #[test]
    fn same_cluster_target_wins_over_other_clusters() {
        let nodes = vec![
            node(0, "Rust", "CREATE_NEW"),
            node(1, "Rust", "CREATE_NEW"),
            node(1, "rust-lang", "MERGE_WITH:rust"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals[2], Terminal::Create(1));
    }

    #[test]
    fn chains_cross_clusters_when_needed() {
        let nodes = vec![
            node(0, "PostgreSQL", "CREATE_NEW"),
            node(1, "Postgres", "MERGE_WITH:PostgreSQL"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals[1], Terminal::Create(0));
    }

    #[test]
    fn merge_into_linked_mention_links() {
        let nodes = vec![
            node(0, "React", "ent-react"),
            node(0, "ReactJS", "MERGE_WITH:React"),
        ];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals[1], Terminal::Link("ent-react".into()));
    }

    #[test]
    fn canonical_name_is_a_merge_target() {
        let mut nodes = vec![node(0, "react", "CREATE_NEW"), node(0, "reactjs", "MERGE_WITH:React")];
        nodes[0].canonical_name = "React".into();
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert_eq!(terminals[1], Terminal::Create(0));
    }

    #[test]
    fn self_merge_is_unresolved() {
        let nodes = vec![node(0, "Solo", "MERGE_WITH:Solo")];
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert!(matches!(terminals[0], Terminal::Unresolved(_)));
    }

    #[test]
    fn long_chain_resolves() {
        let mut nodes = vec![node(0, "n0", "CREATE_NEW")];
        for i in 1..500 {
            nodes.push(node(0, &format!("n{i}"), &format!("MERGE_WITH:n{}", i - 1)));
        }
        nodes.reverse();
        let terminals = MergeChains::new(&nodes).resolve().unwrap();
        assert!(terminals.iter().all(|t| *t == Terminal::Create(499)));
    }
}
