mod docker;

pub use docker::DockerScheduler;

use async_trait::async_trait;
use futures::Stream;
use gantry_buildkit::{DockerImage, ImageBuildEvent};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Represents different scheduler failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// Failed to communicate with scheduler due to network error or other.
    #[error("could not connect to scheduler; {0}")]
    Connection(String),

    /// Container requested by name could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// Image requested by name could not be found.
    #[error("docker image not found; {0}")]
    NoSuchImage(String),

    /// The daemon ran the build and the build itself failed.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("could not prepare build context; {0}")]
    BuildContext(String),

    #[error("operation was cancelled")]
    Cancelled,

    /// An expected and unknown error has occurred.
    #[error("unexpected scheduler error occurred; {0}")]
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct BuildImageRequest {
    /// Directory sent to the daemon as the build context.
    pub context_directory: PathBuf,
    /// Path of the Dockerfile inside the context.
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    /// Tag applied to the built image.
    pub tag: String,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct StartContainerRequest {
    /// A unique identifier to identify the container with.
    pub name: String,
    /// The docker image repository and docker image name; tag can be included.
    pub image: String,
    /// Replaces container's cmd instruction with a custom one.
    pub command: Option<Vec<String>>,
    /// Environment variables to be passed to the container.
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartContainerResponse {
    /// The daemon's own identifier for the container.
    pub scheduler_id: String,
}

#[derive(Debug, Clone)]
pub struct StopContainerRequest {
    /// A unique identifier to identify the container with.
    pub name: String,
    /// The total time the scheduler should wait for a graceful stop before issuing a SIGKILL.
    pub timeout: i64,
}

#[derive(Debug, Clone)]
pub struct GetLogsRequest {
    /// Unique identifier for the container.
    pub name: String,
}

/// Represents a single log line/entry from a particular container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Log {
    Unknown,
    Stdout(bytes::Bytes),
    Stderr(bytes::Bytes),
}

/// The scheduler trait defines what the interface between gantry and a container engine should look like.
#[async_trait]
pub trait Scheduler: Debug + Send + Sync {
    /// Build an image from a local directory. Human readable progress is written to `output` and structured
    /// progress is reported through `on_event` while the build runs.
    async fn build_image(
        &self,
        request: BuildImageRequest,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        on_event: &(dyn Fn(ImageBuildEvent) + Send + Sync),
    ) -> Result<DockerImage, SchedulerError>;

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<DockerImage, SchedulerError>;

    /// Create and start a container, replacing any previous container with the same name.
    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError>;

    /// Wait for a container to exit and return its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64, SchedulerError>;

    /// Stop a container with an associated timeout if the container does not respond to graceful shutdown.
    async fn stop_container(&self, request: StopContainerRequest) -> Result<(), SchedulerError>;

    async fn remove_container(&self, name: &str) -> Result<(), SchedulerError>;

    /// Returns a stream of logs from the container, following it until it exits.
    fn get_logs(
        &self,
        request: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>>;
}
