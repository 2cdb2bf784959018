mod build;
mod graph;
mod run;
mod tasks;

use crate::conf::{self, Config, LogFormat};
use crate::project::{Configuration, DEFAULT_CONFIG_FILE};
use crate::scheduler::{DockerScheduler, Scheduler};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info_span;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gantry")]
#[command(about = "Gantry runs project tasks inside Docker containers.")]
#[command(
    long_about = "Gantry runs project tasks inside Docker containers.\n\n A project file (gantry.yml) describes the \
    containers a project needs, how their images are built or pulled and the tasks that run in them. Gantry \
    starts a task's containers in dependency order, follows its output and cleans up afterwards."
)]
#[command(version)]
pub struct Cli {
    /// Set configuration path; if empty default paths are used
    #[arg(long, value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,

    /// Project file describing the containers and tasks
    #[arg(short = 'f', long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE, global = true)]
    config_file: PathBuf,

    /// Write internal logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Minimum level of internal logs to show; overrides configuration and RUST_LOG
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a task after its prerequisites.
    Run(run::RunArgs),

    /// List the tasks the project defines.
    Tasks,

    /// Show the containers a task needs and the order they start in.
    Graph {
        /// Task to show the graph for.
        task: String,
    },

    /// Build the image of a single container, showing build progress.
    Build {
        /// Container whose image should be built.
        container: String,
    },
}

/// State shared by every command.
struct CliHarness {
    config: Config,
    project_file: PathBuf,
}

impl CliHarness {
    fn project(&self) -> Result<Configuration> {
        Configuration::load(&self.project_file).with_context(|| {
            format!(
                "Could not load project file '{}'",
                self.project_file.display()
            )
        })
    }

    async fn scheduler(&self) -> Result<Arc<dyn Scheduler>> {
        let scheduler = DockerScheduler::new(&self.config.docker, info_span!("scheduler"))
            .await
            .context("Could not connect to Docker")?;

        Ok(Arc::new(scheduler))
    }
}

impl Cli {
    /// Loads configuration, sets up logging and runs the requested command. Returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let mut config = Config::load(self.config_path.as_deref())?;

        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if self.no_color {
            config.general.no_color = true;
        }
        if config.general.no_color {
            colored::control::set_override(false);
        }

        init_logging(
            &config.general,
            self.log_level.is_some(),
            self.log_file.as_deref(),
        )?;

        let harness = CliHarness {
            config,
            project_file: self.config_file,
        };

        match self.command {
            Commands::Run(args) => harness.run_task(args).await,
            Commands::Tasks => harness.list_tasks().map(|_| 0),
            Commands::Graph { task } => harness.show_graph(&task).map(|_| 0),
            Commands::Build { container } => harness.build_container(&container).await.map(|_| 0),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the configured level unless the level
/// was given explicitly on the command line.
fn init_logging(config: &conf::General, level_forced: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if level_forced {
        EnvFilter::try_new(&config.log_level)
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))
    }
    .with_context(|| format!("Invalid log level '{}'", config.log_level))?;

    let (writer, ansi) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Could not open log file '{}'", path.display()))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), !config.no_color),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);

    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Pretty => registry.with(layer).try_init(),
    }
    .context("Could not initialize logging")
}
