use super::{ConfigError, Configuration, ImageSource};
use std::str::FromStr;
use tracing::{info, Span};

/// Replaces a container's image with one pulled from a registry, given on the command line as
/// `<container>=<image>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOverride {
    pub container: String,
    pub image: String,
}

impl FromStr for ImageOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((container, image)) = s.split_once('=') else {
            return Err(ConfigError::InvalidImageOverride(s.to_string()));
        };

        if container.trim().is_empty() || image.trim().is_empty() {
            return Err(ConfigError::InvalidImageOverride(s.to_string()));
        }

        Ok(Self {
            container: container.trim().to_string(),
            image: image.trim().to_string(),
        })
    }
}

/// Produces the configuration a single task run actually uses: the project configuration with any
/// command line overrides applied.
#[derive(Debug, Clone)]
pub struct TaskSpecialisedConfigurationFactory {
    span: Span,
}

impl TaskSpecialisedConfigurationFactory {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn create(
        &self,
        config: &Configuration,
        task_name: &str,
        overrides: &[ImageOverride],
    ) -> Result<Configuration, ConfigError> {
        let mut specialised = config.clone();

        for image_override in overrides {
            let container = specialised
                .containers
                .get_mut(&image_override.container)
                .ok_or_else(|| {
                    ConfigError::UnknownOverrideContainer(image_override.container.clone())
                })?;

            container.image_source = ImageSource::Pull {
                image: image_override.image.clone(),
            };
        }

        info!(
            parent: &self.span,
            task = task_name,
            overrides = ?overrides,
            "Created task-specialised configuration."
        );

        Ok(specialised)
    }
}
