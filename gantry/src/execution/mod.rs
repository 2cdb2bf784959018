//! Runs tasks: prepares the images a task needs, starts its containers in dependency order, follows the
//! main container until it exits and cleans up afterwards.


use crate::conf;
use crate::graph::{
    ContainerDependencyGraph, DependencyGraphProvider, GraphError, TaskExecutionOrderResolver,
};
use crate::project::{Configuration, Container, ImageSource, Task};
use crate::scheduler::{
    BuildImageRequest, GetLogsRequest, Log, Scheduler, SchedulerError, StartContainerRequest,
    StopContainerRequest,
};
use futures::{future::try_join_all, StreamExt};
use gantry_buildkit::ImageBuildEvent;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("could not prepare image for container '{container}'; {source}")]
    ImagePreparation {
        container: String,
        #[source]
        source: SchedulerError,
    },

    #[error("could not run container '{container}'; {source}")]
    Container {
        container: String,
        #[source]
        source: SchedulerError,
    },

    #[error("task execution was cancelled")]
    Cancelled,

    #[error("could not write task output; {0}")]
    Output(#[from] std::io::Error),
}

const BUILD_OUTPUT_BUFFER_SIZE: usize = 8 * 1024;

/// Tag given to the image built for `container`. Image references must be lowercase.
pub fn image_tag(project_name: &str, container: &str) -> String {
    format!("{project_name}-{container}").to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Maximum number of images prepared at the same time.
    pub max_parallelism: usize,
    pub cleanup_after_success: bool,
    pub cleanup_after_failure: bool,
    /// Run only the requested task, ignoring its prerequisites.
    pub skip_prerequisites: bool,
    /// Seconds a container gets to stop before it is killed.
    pub stop_timeout: i64,
}

impl From<&conf::Execution> for RunOptions {
    fn from(config: &conf::Execution) -> Self {
        Self {
            max_parallelism: config.max_parallelism,
            cleanup_after_success: config.cleanup_after_success,
            cleanup_after_failure: config.cleanup_after_failure,
            skip_prerequisites: false,
            stop_timeout: config.stop_timeout,
        }
    }
}

/// Runs tasks of one project configuration against a scheduler. Build progress and container output are
/// written to `output`.
#[derive(Debug)]
pub struct TaskRunner<W> {
    span: Span,
    scheduler: Arc<dyn Scheduler>,
    config: Arc<Configuration>,
    options: RunOptions,
    cancel: CancellationToken,
    output: Mutex<W>,
}

impl<W> TaskRunner<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(
        span: Span,
        scheduler: Arc<dyn Scheduler>,
        config: Arc<Configuration>,
        options: RunOptions,
        output: W,
    ) -> Self {
        Self {
            span,
            scheduler,
            config,
            options,
            cancel: CancellationToken::new(),
            output: Mutex::new(output),
        }
    }

    /// Stops image builds and log following once `cancel` is triggered. Started containers are still
    /// cleaned up.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn into_output(self) -> W {
        self.output.into_inner()
    }

    /// Runs `task_name` after its prerequisites and returns the exit code of the last container that ran.
    ///
    /// A prerequisite exiting non-zero stops the run and its exit code is returned.
    pub async fn run(&self, task_name: &str) -> Result<i64, ExecutionError> {
        let order = if self.options.skip_prerequisites {
            if self.config.task(task_name).is_none() {
                return Err(GraphError::TaskNotFound(task_name.to_string()).into());
            }
            vec![task_name.to_string()]
        } else {
            TaskExecutionOrderResolver.resolve(&self.config, task_name)?
        };

        info!(parent: &self.span, task = task_name, order = ?order, "Resolved task execution order.");

        let mut exit_code = 0;

        for name in &order {
            let task = self
                .config
                .task(name)
                .ok_or_else(|| GraphError::TaskNotFound(name.clone()))?;

            if task.run.is_none() {
                debug!(parent: &self.span, task = %name, "Task only groups prerequisites; nothing to run");
                continue;
            }

            exit_code = self.run_task(task).await?;

            if exit_code != 0 {
                info!(parent: &self.span, task = %name, exit_code, "Task failed; not running any further tasks.");
                return Ok(exit_code);
            }
        }

        Ok(exit_code)
    }

    async fn run_task(&self, task: &Task) -> Result<i64, ExecutionError> {
        let graph = DependencyGraphProvider::new(self.span.clone()).create_graph(&self.config, task)?;
        let order = graph.execution_order();

        let images = self.prepare_images(&order).await?;

        let mut started = vec![];
        let result = self
            .start_and_wait(task, &graph, &order, &images, &mut started)
            .await;

        let cleanup = if matches!(result, Ok(0)) {
            self.options.cleanup_after_success
        } else {
            self.options.cleanup_after_failure
        };

        if cleanup {
            self.clean_up(&started).await;
        } else if !started.is_empty() {
            info!(parent: &self.span, task = %task.name, containers = ?started, "Leaving containers in place.");
        }

        result
    }

    /// Builds or pulls the image of every container in `order`, at most `max_parallelism` at a time.
    /// Returns the image reference to start each container with.
    async fn prepare_images(
        &self,
        order: &[String],
    ) -> Result<BTreeMap<String, String>, ExecutionError> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallelism.max(1)));

        let preparations = order.iter().map(|name| {
            let semaphore = semaphore.clone();

            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ExecutionError::Cancelled)?;

                let container =
                    self.config
                        .container(name)
                        .ok_or_else(|| GraphError::UnknownContainer {
                            container: name.clone(),
                            referenced_by: "the dependency graph".to_string(),
                        })?;

                let image = self.prepare_image(container).await?;
                Ok::<_, ExecutionError>((name.clone(), image))
            }
        });

        let images = try_join_all(preparations).await?;
        Ok(images.into_iter().collect())
    }

    async fn prepare_image(&self, container: &Container) -> Result<String, ExecutionError> {
        let image_error = |source: SchedulerError| ExecutionError::ImagePreparation {
            container: container.name.clone(),
            source,
        };

        match &container.image_source {
            ImageSource::Pull { image } => {
                self.scheduler.pull_image(image).await.map_err(image_error)?;
                debug!(parent: &self.span, container = %container.name, image = %image, "Image pulled");
                Ok(image.clone())
            }
            ImageSource::Build {
                build_directory,
                dockerfile,
                build_args,
            } => {
                let tag = image_tag(&self.config.project_name, &container.name);

                let span = self.span.clone();
                let container_name = container.name.clone();
                let on_event = move |event: ImageBuildEvent| {
                    if let ImageBuildEvent::BuildProgress(steps) = event {
                        let steps = steps.iter().map(ToString::to_string).collect::<Vec<_>>();
                        info!(parent: &span, container = %container_name, steps = ?steps, "Building image.");
                    }
                };

                let request = BuildImageRequest {
                    context_directory: build_directory.clone(),
                    dockerfile: dockerfile.clone(),
                    build_args: build_args.clone(),
                    tag: tag.clone(),
                    cancel: self.cancel.child_token(),
                };

                let (writer, reader) = tokio::io::duplex(BUILD_OUTPUT_BUFFER_SIZE);

                let build = async move {
                    let mut writer = writer;
                    let result = self
                        .scheduler
                        .build_image(request, &mut writer, &on_event)
                        .await;

                    // Closing the pipe ends the forwarding.
                    drop(writer);
                    result
                };

                let (result, forwarded) =
                    tokio::join!(build, self.forward_build_output(&container.name, reader));
                forwarded?;

                let image = result.map_err(|e| match e {
                    SchedulerError::Cancelled => ExecutionError::Cancelled,
                    other => image_error(other),
                })?;

                info!(parent: &self.span, container = %container.name, tag = %tag, image = %image, "Image built.");
                Ok(tag)
            }
        }
    }

    /// Starts the task's containers and follows the main container until it exits. Every container that was
    /// started is added to `started`, so the caller can clean up after failures too.
    async fn start_and_wait(
        &self,
        task: &Task,
        graph: &ContainerDependencyGraph,
        order: &[String],
        images: &BTreeMap<String, String>,
        started: &mut Vec<String>,
    ) -> Result<i64, ExecutionError> {
        let run = task
            .run
            .as_ref()
            .ok_or_else(|| GraphError::NoMainContainer(task.name.clone()))?;

        for name in order.iter().filter(|name| **name != graph.root) {
            let container = self.container(name)?;

            let request = StartContainerRequest {
                name: self.container_name(task, name),
                image: self.image_for(name, images)?,
                command: container.command.clone(),
                environment: container.environment.clone(),
                working_directory: container.working_directory.clone(),
            };

            self.start_container(request, started).await?;
        }

        let root = self.container(&graph.root)?;

        let mut environment = root.environment.clone();
        environment.extend(run.environment.clone());

        let main_name = self.container_name(task, &graph.root);
        let request = StartContainerRequest {
            name: main_name.clone(),
            image: self.image_for(&graph.root, images)?,
            command: run.command.clone().or_else(|| root.command.clone()),
            environment,
            working_directory: root.working_directory.clone(),
        };

        self.start_container(request, started).await?;
        info!(parent: &self.span, task = %task.name, container = %main_name, "Task container started.");

        self.follow_logs(&main_name).await?;

        let exit_code = self
            .scheduler
            .wait_container(&main_name)
            .await
            .map_err(|source| ExecutionError::Container {
                container: main_name.clone(),
                source,
            })?;

        info!(parent: &self.span, task = %task.name, exit_code, "Task finished.");
        Ok(exit_code)
    }

    async fn start_container(
        &self,
        request: StartContainerRequest,
        started: &mut Vec<String>,
    ) -> Result<(), ExecutionError> {
        let name = request.name.clone();

        let response = self
            .scheduler
            .start_container(request)
            .await
            .map_err(|source| ExecutionError::Container {
                container: name.clone(),
                source,
            })?;

        debug!(parent: &self.span, container = %name, scheduler_id = %response.scheduler_id, "Container started");
        started.push(name);
        Ok(())
    }

    async fn follow_logs(&self, container_name: &str) -> Result<(), ExecutionError> {
        let mut logs = self.scheduler.get_logs(GetLogsRequest {
            name: container_name.to_string(),
        });

        loop {
            let log = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                log = logs.next() => log,
            };

            let Some(log) = log else {
                break;
            };

            match log {
                Ok(Log::Stdout(message)) | Ok(Log::Stderr(message)) => {
                    self.write_output(&message).await?;
                }
                Ok(Log::Unknown) => {}
                Err(e) => {
                    debug!(parent: &self.span, container = container_name, err = %e, "Log stream ended early");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stops and removes containers in the reverse order they were started. Failures are logged only.
    async fn clean_up(&self, started: &[String]) {
        for name in started.iter().rev() {
            if let Err(e) = self
                .scheduler
                .stop_container(StopContainerRequest {
                    name: name.clone(),
                    timeout: self.options.stop_timeout,
                })
                .await
            {
                debug!(parent: &self.span, container = %name, err = %e, "Could not stop container");
            }

            if let Err(e) = self.scheduler.remove_container(name).await {
                error!(parent: &self.span, container = %name, err = %e, "Could not remove container");
            }
        }
    }

    /// Copies build output to the shared output line by line as it arrives. Each line is prefixed with the
    /// container name so concurrent builds stay readable.
    async fn forward_build_output<R>(
        &self,
        container: &str,
        reader: R,
    ) -> Result<(), ExecutionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);

            let prefixed = if text.is_empty() {
                format!("{container} |\n")
            } else {
                format!("{container} | {text}\n")
            };

            self.write_output(prefixed.as_bytes()).await?;
        }
    }

    async fn write_output(&self, content: &[u8]) -> Result<(), ExecutionError> {
        if content.is_empty() {
            return Ok(());
        }

        let mut output = self.output.lock().await;
        output.write_all(content).await?;
        output.flush().await?;
        Ok(())
    }

    fn container(&self, name: &str) -> Result<&Container, ExecutionError> {
        self.config.container(name).ok_or_else(|| {
            GraphError::UnknownContainer {
                container: name.to_string(),
                referenced_by: "the dependency graph".to_string(),
            }
            .into()
        })
    }

    fn container_name(&self, task: &Task, container: &str) -> String {
        format!("{}-{}-{}", self.config.project_name, task.name, container)
    }

    fn image_for(
        &self,
        container: &str,
        images: &BTreeMap<String, String>,
    ) -> Result<String, ExecutionError> {
        images.get(container).cloned().ok_or_else(|| {
            ExecutionError::ImagePreparation {
                container: container.to_string(),
                source: SchedulerError::NoSuchImage(container.to_string()),
            }
        })
    }
}
