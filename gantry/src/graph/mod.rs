//! Works out which containers a task needs and in which order tasks and containers have to start.

mod dag;
mod order;


pub use dag::{Dag, DagError};
pub use order::TaskExecutionOrderResolver;

use crate::project::{Configuration, Task};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, Span};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("container '{container}' referenced by {referenced_by} does not exist")]
    UnknownContainer {
        container: String,
        referenced_by: String,
    },

    #[error("containers have a dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("task '{0}' does not exist")]
    TaskNotFound(String),

    #[error("task '{task}' is listed as a prerequisite of task '{referenced_by}' but does not exist")]
    UnknownTask { task: String, referenced_by: String },

    #[error("a cycle was detected creating a dependency from task '{from}' to task '{to}'")]
    TaskCycle { from: String, to: String },

    #[error("task '{0}' does not run a container")]
    NoMainContainer(String),

    #[error("could not build the dependency graph; {0}")]
    Dag(#[from] DagError),
}

/// The containers one task needs: its main container and everything that container depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDependencyGraph {
    pub task_name: String,
    /// The task's main container.
    pub root: String,
    /// Direct dependencies of every container in the graph.
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl ContainerDependencyGraph {
    pub fn adjacency(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.adjacency
    }

    pub fn dependencies_of(&self, container: &str) -> Option<&BTreeSet<String>> {
        self.adjacency.get(container)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.adjacency.keys().map(String::as_str)
    }

    /// Every container in the graph, each after all of its dependencies. The main container is always last.
    pub fn execution_order(&self) -> Vec<String> {
        let mut order = vec![];
        let mut visited = BTreeSet::new();
        self.visit_post_order(&self.root, &mut visited, &mut order);
        order
    }

    fn visit_post_order<'a>(
        &'a self,
        container: &'a str,
        visited: &mut BTreeSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if !visited.insert(container) {
            return;
        }

        for dependency in self.adjacency.get(container).into_iter().flatten() {
            self.visit_post_order(dependency, visited, order);
        }

        order.push(container.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraphProvider {
    span: Span,
}

impl DependencyGraphProvider {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Resolves the containers `task` needs.
    ///
    /// The main container depends on its own declared dependencies plus the task's. Every other container
    /// depends on its declared dependencies only.
    pub fn create_graph(
        &self,
        config: &Configuration,
        task: &Task,
    ) -> Result<ContainerDependencyGraph, GraphError> {
        let run = task
            .run
            .as_ref()
            .ok_or_else(|| GraphError::NoMainContainer(task.name.clone()))?;

        let root =
            config
                .container(&run.container)
                .ok_or_else(|| GraphError::UnknownContainer {
                    container: run.container.clone(),
                    referenced_by: format!("task '{}'", task.name),
                })?;

        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|name| config.container(name).is_none())
        {
            return Err(GraphError::UnknownContainer {
                container: missing.clone(),
                referenced_by: format!("task '{}'", task.name),
            });
        }

        let root_dependencies = root
            .dependencies
            .union(&task.dependencies)
            .cloned()
            .collect();

        let mut adjacency = BTreeMap::new();
        let mut path = vec![];
        visit(config, &root.name, root_dependencies, &mut path, &mut adjacency)?;

        let graph = ContainerDependencyGraph {
            task_name: task.name.clone(),
            root: root.name.clone(),
            adjacency,
        };

        info!(
            parent: &self.span,
            task = %task.name,
            dependencies = ?graph.adjacency,
            "Dependency graph for task created."
        );

        Ok(graph)
    }
}

/// Depth-first walk recording each container's dependencies. `path` holds the containers currently being
/// visited so a dependency back onto it can be reported as a cycle.
fn visit(
    config: &Configuration,
    container: &str,
    dependencies: BTreeSet<String>,
    path: &mut Vec<String>,
    adjacency: &mut BTreeMap<String, BTreeSet<String>>,
) -> Result<(), GraphError> {
    path.push(container.to_string());
    adjacency.insert(container.to_string(), dependencies.clone());

    for dependency in &dependencies {
        if let Some(start) = path.iter().position(|name| name == dependency) {
            let mut cycle = path[start..].to_vec();
            cycle.push(dependency.clone());
            return Err(GraphError::DependencyCycle { cycle });
        }

        if adjacency.contains_key(dependency) {
            continue;
        }

        let resolved = config
            .container(dependency)
            .ok_or_else(|| GraphError::UnknownContainer {
                container: dependency.clone(),
                referenced_by: format!("container '{container}'"),
            })?;

        visit(
            config,
            dependency,
            resolved.dependencies.clone(),
            path,
            adjacency,
        )?;
    }

    path.pop();
    Ok(())
}
