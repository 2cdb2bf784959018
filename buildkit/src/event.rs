use std::fmt::Display;

/// A built image, identified by the content addressed ID the daemon reports for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DockerImage {
    pub id: String,
}

impl DockerImage {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl Display for DockerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A view of a build step that is currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveImageBuildStep {
    NotDownloading {
        /// The 1-based display index of the step. It is the same `N` the rendered output shows as `#N`.
        step_index: usize,
        name: String,
    },

    /// The step is pulling content (usually image layers) and reports how far along it is.
    Downloading {
        /// The 1-based display index of the step. It is the same `N` the rendered output shows as `#N`.
        step_index: usize,
        name: String,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
}

impl ActiveImageBuildStep {
    /// The 1-based display index shared with the `#N` prefix of the rendered output.
    pub fn step_index(&self) -> usize {
        match self {
            Self::NotDownloading { step_index, .. } | Self::Downloading { step_index, .. } => {
                *step_index
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NotDownloading { name, .. } | Self::Downloading { name, .. } => name,
        }
    }
}

impl Display for ActiveImageBuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDownloading { step_index, name } => write!(f, "#{step_index} {name}"),
            Self::Downloading {
                step_index,
                name,
                bytes_downloaded,
                total_bytes,
            } => write!(
                f,
                "#{step_index} {name} ({bytes_downloaded}/{total_bytes} bytes)"
            ),
        }
    }
}

/// Structured updates emitted while a build response is processed.
///
/// [`ImageBuildEvent::BuildError`] and [`ImageBuildEvent::BuildComplete`] are terminal: once either has been
/// emitted for a stream nothing else is emitted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBuildEvent {
    /// The set of running steps changed. Steps are ordered by display index.
    BuildProgress(Vec<ActiveImageBuildStep>),

    /// The daemon reported that the build failed. This is a normal outcome of a build, not a fault
    /// in processing the response.
    BuildError(String),

    BuildComplete(DockerImage),
}

impl ImageBuildEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::BuildError(_) | Self::BuildComplete(_))
    }
}
