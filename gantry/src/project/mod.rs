//! The project file: the containers a project uses and the tasks that run in them.

mod overrides;

#[cfg(test)]
mod tests;

pub use overrides::{ImageOverride, TaskSpecialisedConfigurationFactory};

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "gantry.yml";
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration file '{0}' does not exist")]
    FileNotFound(String),

    #[error("could not parse config; {0}")]
    Parsing(String),

    #[error("invalid container '{container}'; {reason}")]
    InvalidContainer { container: String, reason: String },

    #[error("invalid task '{task}'; {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("invalid image override '{0}'; expected format is <container>=<image>")]
    InvalidImageOverride(String),

    #[error("cannot override the image for container '{0}'; no container with that name exists")]
    UnknownOverrideContainer(String),
}

/// Where a container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Pull {
        image: String,
    },
    Build {
        /// Absolute path of the build context.
        build_directory: PathBuf,
        /// Path of the Dockerfile inside the build context.
        dockerfile: String,
        build_args: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image_source: ImageSource,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,

    /// Containers that must be running before this one starts.
    pub dependencies: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunConfiguration {
    pub container: String,
    /// Replaces the container's own command.
    pub command: Option<Vec<String>>,
    /// Added to (and overriding) the container's environment.
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    pub group: Option<String>,

    /// Tasks made only of prerequisites have nothing to run themselves.
    pub run: Option<TaskRunConfiguration>,

    /// Extra containers the task's main container depends on, on top of the container's own dependencies.
    pub dependencies: BTreeSet<String>,

    /// Tasks to run before this one, in order.
    pub prerequisites: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub project_name: String,
    pub containers: BTreeMap<String, Container>,
    pub tasks: BTreeMap<String, Task>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfiguration {
    project_name: Option<String>,
    #[serde(default)]
    containers: BTreeMap<String, RawContainer>,
    #[serde(default)]
    tasks: BTreeMap<String, RawTask>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawContainer {
    image: Option<String>,
    build_directory: Option<PathBuf>,
    dockerfile: Option<String>,
    #[serde(default)]
    build_args: BTreeMap<String, String>,
    command: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    working_directory: Option<String>,
    #[serde(default)]
    dependencies: BTreeSet<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawTask {
    description: Option<String>,
    group: Option<String>,
    run: Option<RawTaskRun>,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawTaskRun {
    container: String,
    command: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

impl Configuration {
    /// Reads and validates the project file at `path`.
    ///
    /// Relative build directories are resolved against the directory containing the file, and the project
    /// name defaults to that directory's name.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let path = std::path::absolute(path).map_err(|e| ConfigError::Parsing(e.to_string()))?;
        let project_directory = path.parent().unwrap_or(Path::new("/"));

        Self::from_figment(Figment::from(Yaml::file(&path)), project_directory)
    }

    /// Parses a project file's contents as if it lived in `project_directory`.
    pub fn from_yaml(content: &str, project_directory: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::from(Yaml::string(content)), project_directory)
    }

    fn from_figment(figment: Figment, project_directory: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfiguration = figment
            .extract()
            .map_err(|e| ConfigError::Parsing(e.to_string()))?;

        let project_name = match raw.project_name {
            Some(name) if !name.trim().is_empty() => name,
            Some(_) => {
                return Err(ConfigError::Parsing(
                    "project_name cannot be empty".to_string(),
                ))
            }
            None => project_directory
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "gantry".to_string()),
        };

        let containers = raw
            .containers
            .into_iter()
            .map(|(name, container)| {
                let container = Container::from_raw(&name, container, project_directory)?;
                Ok((name, container))
            })
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        let tasks = raw
            .tasks
            .into_iter()
            .map(|(name, task)| {
                let task = Task::from_raw(&name, task)?;
                Ok((name, task))
            })
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        Ok(Self {
            project_name,
            containers,
            tasks,
        })
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }
}

impl Container {
    fn from_raw(name: &str, raw: RawContainer, project_directory: &Path) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidContainer {
            container: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("container names cannot be empty"));
        }

        let image_source = match (raw.image, raw.build_directory) {
            (Some(image), None) => {
                if raw.dockerfile.is_some() || !raw.build_args.is_empty() {
                    return Err(invalid(
                        "dockerfile and build_args can only be used with build_directory",
                    ));
                }
                ImageSource::Pull { image }
            }
            (None, Some(directory)) => ImageSource::Build {
                build_directory: project_directory.join(directory),
                dockerfile: raw
                    .dockerfile
                    .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
                build_args: raw.build_args,
            },
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "only one of image or build_directory can be given",
                ))
            }
            (None, None) => return Err(invalid("one of image or build_directory is required")),
        };

        if raw.dependencies.iter().any(|dep| dep.trim().is_empty()) {
            return Err(invalid("dependency names cannot be empty"));
        }

        let command = raw
            .command
            .map(|command| parse_command(&command))
            .transpose()
            .map_err(|reason| invalid(&reason))?;

        Ok(Self {
            name: name.to_string(),
            image_source,
            command,
            environment: raw.environment,
            working_directory: raw.working_directory,
            dependencies: raw.dependencies,
        })
    }
}

impl Task {
    fn from_raw(name: &str, raw: RawTask) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTask {
            task: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("task names cannot be empty"));
        }

        let run = match raw.run {
            Some(run) => {
                if run.container.trim().is_empty() {
                    return Err(invalid("run.container cannot be empty"));
                }

                let command = run
                    .command
                    .map(|command| parse_command(&command))
                    .transpose()
                    .map_err(|reason| invalid(&reason))?;

                Some(TaskRunConfiguration {
                    container: run.container,
                    command,
                    environment: run.environment,
                })
            }
            None if raw.prerequisites.is_empty() => {
                return Err(invalid(
                    "a task must either run a container or have prerequisites",
                ))
            }
            None => None,
        };

        if raw.dependencies.iter().any(|dep| dep.trim().is_empty()) {
            return Err(invalid("dependency names cannot be empty"));
        }

        if raw.prerequisites.iter().any(|dep| dep.trim().is_empty()) {
            return Err(invalid("prerequisite names cannot be empty"));
        }

        Ok(Self {
            name: name.to_string(),
            description: raw.description,
            group: raw.group,
            run,
            dependencies: raw.dependencies,
            prerequisites: raw.prerequisites,
        })
    }
}

/// Splits a command line into arguments with POSIX shell quoting rules.
pub fn parse_command(command: &str) -> Result<Vec<String>, String> {
    let args = shlex::split(command).ok_or_else(|| {
        format!("command '{command}' has an unbalanced quote or a dangling backslash")
    })?;

    if args.is_empty() {
        return Err("command cannot be empty".to_string());
    }

    Ok(args)
}
