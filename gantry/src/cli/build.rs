use super::CliHarness;
use crate::execution::image_tag;
use crate::project::ImageSource;
use crate::scheduler::BuildImageRequest;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use gantry_buildkit::ImageBuildEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

impl CliHarness {
    pub async fn build_container(&self, container_name: &str) -> Result<()> {
        let project = self.project()?;

        let Some(container) = project.container(container_name) else {
            bail!("container '{container_name}' does not exist");
        };

        let ImageSource::Build {
            build_directory,
            dockerfile,
            build_args,
        } = &container.image_source
        else {
            bail!("container '{container_name}' uses a registry image; there is nothing to build");
        };

        let scheduler = self.scheduler().await?;

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let span = info_span!("build", container = container_name);
        let on_event = move |event: ImageBuildEvent| {
            debug!(parent: &span, event = ?event, "Build event");
        };

        let tag = image_tag(&project.project_name, container_name);
        let image = scheduler
            .build_image(
                BuildImageRequest {
                    context_directory: build_directory.clone(),
                    dockerfile: dockerfile.clone(),
                    build_args: build_args.clone(),
                    tag: tag.clone(),
                    cancel,
                },
                &mut tokio::io::stdout(),
                &on_event,
            )
            .await
            .with_context(|| format!("Could not build image for container '{container_name}'"))?;

        println!("{} Built image {} ({})", "✓".green(), tag, image);
        Ok(())
    }
}
