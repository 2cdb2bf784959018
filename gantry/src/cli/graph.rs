use super::CliHarness;
use crate::graph::{ContainerDependencyGraph, DependencyGraphProvider, TaskExecutionOrderResolver};
use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info_span;

impl CliHarness {
    pub fn show_graph(&self, task_name: &str) -> Result<()> {
        let project = self.project()?;

        let order = TaskExecutionOrderResolver
            .resolve(&project, task_name)
            .with_context(|| format!("Could not resolve prerequisites of task '{task_name}'"))?;

        println!("{} {}", "Task order:".bold(), order.join(" -> "));

        for name in &order {
            let Some(task) = project.task(name) else {
                continue;
            };
            if task.run.is_none() {
                continue;
            }

            let graph = DependencyGraphProvider::new(info_span!("graph", task = %name))
                .create_graph(&project, task)
                .with_context(|| format!("Could not resolve containers of task '{name}'"))?;

            println!();
            print!("{}", format_graph(&graph));
        }

        Ok(())
    }
}

fn format_graph(graph: &ContainerDependencyGraph) -> String {
    let mut output = format!("{} {}\n", "Task:".bold(), graph.task_name.green());

    for container in graph.nodes() {
        let dependencies = graph
            .dependencies_of(container)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>();

        if dependencies.is_empty() {
            output.push_str(&format!("  {container}\n"));
        } else {
            output.push_str(&format!("  {container} -> {}\n", dependencies.join(", ")));
        }
    }

    output.push_str(&format!(
        "  {} {}\n",
        "start order:".bold(),
        graph.execution_order().join(", ")
    ));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Configuration;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tracing::Span;

    #[test]
    fn graph_lists_dependencies_and_start_order() {
        colored::control::set_override(false);

        let config = Configuration::from_yaml(
            "containers:\n  app:\n    image: app\n    dependencies: [db]\n  db:\n    image: db\ntasks:\n  start:\n    run:\n      container: app\n",
            Path::new("/project"),
        )
        .unwrap();

        let graph = DependencyGraphProvider::new(Span::none())
            .create_graph(&config, config.task("start").unwrap())
            .unwrap();

        assert_eq!(
            format_graph(&graph),
            "Task: start\n  app -> db\n  db\n  start order: db, app\n"
        );
    }
}
