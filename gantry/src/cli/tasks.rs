use super::CliHarness;
use anyhow::Result;
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};

impl CliHarness {
    pub fn list_tasks(&self) -> Result<()> {
        let project = self.project()?;

        if project.tasks.is_empty() {
            println!("No tasks found.");
            return Ok(());
        }

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("name")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("group")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("description")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("prerequisites")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for task in project.tasks.values() {
            table.add_row(vec![
                Cell::new(&task.name).fg(Color::Green),
                Cell::new(task.group.as_deref().unwrap_or_default()),
                Cell::new(
                    task.description
                        .as_deref()
                        .unwrap_or_default()
                        .chars()
                        .take(60)
                        .collect::<String>(),
                ),
                Cell::new(task.prerequisites.join(", ")),
            ]);
        }

        println!("{table}");
        Ok(())
    }
}
