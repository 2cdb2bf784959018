use super::{Dag, DagError, GraphError};
use crate::project::Configuration;
use std::collections::BTreeSet;

/// Works out the tasks to run for a requested task: its prerequisites (recursively, in declared order) and
/// then the task itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskExecutionOrderResolver;

impl TaskExecutionOrderResolver {
    pub fn resolve(&self, config: &Configuration, task_name: &str) -> Result<Vec<String>, GraphError> {
        if config.task(task_name).is_none() {
            return Err(GraphError::TaskNotFound(task_name.to_string()));
        }

        // Edges point from a prerequisite to the task that needs it.
        let mut dag = Dag::new();
        add_prerequisites(config, task_name, &mut dag)?;

        let mut order = vec![];
        let mut visited = BTreeSet::new();
        post_order(config, task_name, &mut visited, &mut order);

        Ok(order)
    }
}

fn add_prerequisites(config: &Configuration, task_name: &str, dag: &mut Dag) -> Result<(), GraphError> {
    if !dag.exists(task_name) {
        dag.add_node(task_name)?;
    }

    let Some(task) = config.task(task_name) else {
        return Ok(());
    };

    for prerequisite in &task.prerequisites {
        if config.task(prerequisite).is_none() {
            return Err(GraphError::UnknownTask {
                task: prerequisite.clone(),
                referenced_by: task_name.to_string(),
            });
        }

        let newly_seen = !dag.exists(prerequisite);
        if newly_seen {
            dag.add_node(prerequisite)?;
        }

        dag.add_edge(prerequisite, task_name).map_err(|e| match e {
            DagError::EdgeCreatesCycle(from, to) => GraphError::TaskCycle { from, to },
            other => GraphError::Dag(other),
        })?;

        if newly_seen {
            add_prerequisites(config, prerequisite, dag)?;
        }
    }

    Ok(())
}

fn post_order<'a>(
    config: &'a Configuration,
    task_name: &'a str,
    visited: &mut BTreeSet<&'a str>,
    order: &mut Vec<String>,
) {
    if !visited.insert(task_name) {
        return;
    }

    if let Some(task) = config.task(task_name) {
        for prerequisite in &task.prerequisites {
            post_order(config, prerequisite, visited, order);
        }
    }

    order.push(task_name.to_string());
}
