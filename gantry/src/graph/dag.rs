use std::collections::{BTreeMap, BTreeSet};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("edges {0} and {1} would create a cycle")]
    EdgeCreatesCycle(String, String),
}

/// A directed graph that refuses edges which would close a cycle.
#[derive(Debug, Default, Clone)]
pub struct Dag(BTreeMap<String, BTreeSet<String>>);

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) -> Result<(), DagError> {
        if self.0.contains_key(id) {
            return Err(DagError::NodeExists(id.to_string()));
        }

        self.0.insert(id.to_string(), BTreeSet::new());
        Ok(())
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if !self.0.contains_key(to) {
            return Err(DagError::NodeNotFound(to.to_string()));
        }

        if self.is_cyclic(from, to) {
            return Err(DagError::EdgeCreatesCycle(from.to_string(), to.to_string()));
        }

        let edges = self
            .0
            .get_mut(from)
            .ok_or_else(|| DagError::NodeNotFound(from.to_string()))?;
        edges.insert(to.to_string());

        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Would an edge from `from` to `to` close a cycle? That is the case when `from` is already reachable
    /// from `to`.
    fn is_cyclic(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut stack = vec![to];
        let mut seen = BTreeSet::new();

        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }

            for edge in self.0.get(node).into_iter().flatten() {
                if edge == from {
                    return true;
                }
                stack.push(edge);
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dag() {
        let mut dag = Dag::new();

        dag.add_node("1").unwrap();
        dag.add_node("2").unwrap();

        dag.add_edge("1", "2").unwrap();

        assert!(dag.exists("1"));
        assert_eq!(
            dag.add_node("1").unwrap_err(),
            DagError::NodeExists("1".into())
        );
        assert_eq!(
            dag.add_edge("1", "3").unwrap_err(),
            DagError::NodeNotFound("3".into())
        );
    }

    #[test]
    fn dag_is_cyclic() {
        let mut dag = Dag::new();

        for node in ["1", "2", "3", "4", "5", "6"] {
            dag.add_node(node).unwrap();
        }

        dag.add_edge("1", "2").unwrap();
        dag.add_edge("2", "3").unwrap();
        dag.add_edge("2", "4").unwrap();
        dag.add_edge("4", "5").unwrap();
        dag.add_edge("5", "6").unwrap();

        assert_eq!(
            dag.add_edge("6", "4").unwrap_err(),
            DagError::EdgeCreatesCycle("6".into(), "4".into())
        );
        assert_eq!(
            dag.add_edge("3", "3").unwrap_err(),
            DagError::EdgeCreatesCycle("3".into(), "3".into())
        );

        dag.add_edge("6", "3").unwrap();
    }

    #[test]
    fn dag_is_acyclic() {
        let mut dag = Dag::new();

        for node in ["1", "2", "3", "4", "5", "6"] {
            dag.add_node(node).unwrap();
        }

        dag.add_edge("1", "2").unwrap();
        dag.add_edge("2", "3").unwrap();
        dag.add_edge("2", "4").unwrap();
        dag.add_edge("4", "5").unwrap();
        dag.add_edge("4", "6").unwrap();
        dag.add_edge("5", "6").unwrap();
        dag.add_edge("6", "3").unwrap();
    }
}
