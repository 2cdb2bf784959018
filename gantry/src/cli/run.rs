use super::CliHarness;
use crate::execution::{RunOptions, TaskRunner};
use crate::project::{ImageOverride, TaskSpecialisedConfigurationFactory};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Task to run.
    task: String,

    /// Use a registry image for a container instead of its configured image, as <CONTAINER>=<IMAGE>.
    /// Can be given more than once.
    #[arg(long = "override-image", value_name = "CONTAINER=IMAGE")]
    override_images: Vec<ImageOverride>,

    /// Maximum number of images to build or pull at the same time.
    #[arg(long, value_name = "N")]
    max_parallelism: Option<usize>,

    /// Run only the given task, not its prerequisites.
    #[arg(long)]
    skip_prerequisites: bool,

    /// Leave containers in place after the task finishes.
    #[arg(long, conflicts_with_all = ["no_cleanup_after_failure", "no_cleanup_after_success"])]
    no_cleanup: bool,

    /// Leave containers in place if the task fails.
    #[arg(long)]
    no_cleanup_after_failure: bool,

    /// Leave containers in place if the task succeeds.
    #[arg(long)]
    no_cleanup_after_success: bool,
}

impl RunArgs {
    fn options(&self, defaults: RunOptions) -> RunOptions {
        RunOptions {
            max_parallelism: self.max_parallelism.unwrap_or(defaults.max_parallelism),
            cleanup_after_success: defaults.cleanup_after_success
                && !(self.no_cleanup || self.no_cleanup_after_success),
            cleanup_after_failure: defaults.cleanup_after_failure
                && !(self.no_cleanup || self.no_cleanup_after_failure),
            skip_prerequisites: self.skip_prerequisites,
            stop_timeout: defaults.stop_timeout,
        }
    }
}

impl CliHarness {
    pub async fn run_task(&self, args: RunArgs) -> Result<i32> {
        let project = self.project()?;
        let project = TaskSpecialisedConfigurationFactory::new(info_span!("configuration"))
            .create(&project, &args.task, &args.override_images)?;

        let options = args.options(RunOptions::from(&self.config.execution));
        debug!(options = ?options, "Running task with options");

        let scheduler = self.scheduler().await?;

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let runner = TaskRunner::new(
            info_span!("task_run", task = %args.task),
            scheduler,
            Arc::new(project),
            options,
            tokio::io::stdout(),
        )
        .with_cancellation(cancel);

        let exit_code = runner
            .run(&args.task)
            .await
            .with_context(|| format!("Could not run task '{}'", args.task))?;

        if exit_code == 0 {
            println!("{} Task '{}' finished", "✓".green(), args.task);
        } else {
            eprintln!(
                "{} Task '{}' exited with code {}",
                "x".red(),
                args.task,
                exit_code
            );
        }

        Ok(i32::try_from(exit_code).unwrap_or(1))
    }
}
