use super::{
    BuildImageRequest, GetLogsRequest, Log, SchedulerError, StartContainerRequest,
    StartContainerResponse, StopContainerRequest,
};
use crate::conf;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use gantry_buildkit::{DockerImage, ImageBuildEvent, ImageBuildResponseBody, ResponseBodyError};
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::io::StreamReader;
use tracing::{debug, debug_span, trace, Span};

fn format_env_var(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Deserialize, Debug)]
struct DaemonError {
    message: String,
}

/// Tars up a build context directory.
async fn build_context(directory: &Path) -> Result<Bytes, SchedulerError> {
    if !directory.is_dir() {
        return Err(SchedulerError::BuildContext(format!(
            "{} is not a directory",
            directory.display()
        )));
    }

    let source = directory.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || {
        let mut archive = tar::Builder::new(Vec::new());
        archive.follow_symlinks(false);
        archive.append_dir_all("", &source)?;
        archive.into_inner()
    })
    .await
    .map_err(|e| SchedulerError::Unknown(e.to_string()))?
    .map_err(|e| SchedulerError::BuildContext(format!("{}: {e}", directory.display())))?;

    Ok(Bytes::from(archive))
}

#[derive(Debug, Clone)]
pub struct DockerScheduler {
    client: bollard::Docker,
    socket: PathBuf,
    buildkit: bool,
    stream_passthrough: bool,
    span: Span,
}

impl DockerScheduler {
    pub async fn new(config: &conf::Docker, span: Span) -> Result<Self, SchedulerError> {
        let client = bollard::Docker::connect_with_socket(
            &config.socket,
            config.timeout,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        // Check that we can actually get a connection.
        let version = client.version().await.map_err(|e| {
            SchedulerError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        debug!(
            parent: &span,
            version = version.version.unwrap_or_default(),
            socket = %config.socket,
            "Local docker scheduler successfully connected"
        );

        Ok(Self {
            client,
            socket: PathBuf::from(&config.socket),
            buildkit: config.buildkit,
            stream_passthrough: config.stream_passthrough,
            span,
        })
    }

    /// BuildKit progress only exists in the raw response body, so the request is made directly over the
    /// daemon socket instead of through bollard.
    async fn build_with_buildkit(
        &self,
        request: BuildImageRequest,
        context: Bytes,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        on_event: &(dyn Fn(ImageBuildEvent) + Send + Sync),
    ) -> Result<DockerImage, SchedulerError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;

        let connection_span = self.span.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(parent: &connection_span, err = %e, "Build connection closed with error");
            }
        });

        let build_args = serde_json::to_string(&request.build_args)
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        let query = encode_query(&[
            ("version", "2".to_string()),
            ("t", request.tag.clone()),
            ("dockerfile", request.dockerfile.clone()),
            ("buildargs", build_args),
            ("rm", "1".to_string()),
        ]);

        let http_request = Request::builder()
            .method(Method::POST)
            .uri(format!("/build?{query}"))
            .header(header::HOST, "docker")
            .header(header::CONTENT_TYPE, "application/x-tar")
            .body(Full::new(context))
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        let response = sender
            .send_request(http_request)
            .await
            .map_err(|e| SchedulerError::Connection(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();

            let message = serde_json::from_slice::<DaemonError>(&body)
                .map(|e| e.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string());

            return Err(SchedulerError::Unknown(format!(
                "daemon rejected build request ({status}); {message}"
            )));
        }

        let body = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        let reader = StreamReader::new(Box::pin(body));

        let response_body = ImageBuildResponseBody::new(debug_span!(
            parent: &self.span,
            "image_build",
            tag = %request.tag
        ))
        .with_stream_passthrough(self.stream_passthrough);

        let mut outcome = None;

        response_body
            .process(
                reader,
                output,
                |event| {
                    if event.is_terminal() && outcome.is_none() {
                        outcome = Some(event.clone());
                    }
                    on_event(event);
                },
                &request.cancel,
            )
            .await
            .map_err(|e| match e {
                ResponseBodyError::Cancelled => SchedulerError::Cancelled,
                other => SchedulerError::Unknown(other.to_string()),
            })?;

        match outcome {
            Some(ImageBuildEvent::BuildComplete(image)) => Ok(image),
            Some(ImageBuildEvent::BuildError(message)) => Err(SchedulerError::BuildFailed(message)),
            _ => Err(SchedulerError::Unknown(
                "build finished without the daemon reporting an image".to_string(),
            )),
        }
    }

    async fn build_with_legacy_builder(
        &self,
        request: BuildImageRequest,
        context: Bytes,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        on_event: &(dyn Fn(ImageBuildEvent) + Send + Sync),
    ) -> Result<DockerImage, SchedulerError> {
        let options = bollard::image::BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            buildargs: request
                .build_args
                .clone()
                .into_iter()
                .collect::<HashMap<_, _>>(),
            rm: true,
            ..Default::default()
        };

        let stream = self.client.build_image(options, None, Some(context));
        tokio::pin!(stream);

        let mut image = None;

        loop {
            let info = tokio::select! {
                biased;

                _ = request.cancel.cancelled() => return Err(SchedulerError::Cancelled),
                info = stream.next() => info,
            };

            let Some(info) = info else {
                break;
            };
            let info = info.map_err(|e| SchedulerError::Unknown(e.to_string()))?;

            if let Some(error) = info.error {
                on_event(ImageBuildEvent::BuildError(error.clone()));
                return Err(SchedulerError::BuildFailed(error));
            }

            if let Some(text) = info.stream {
                output
                    .write_all(text.as_bytes())
                    .await
                    .map_err(|e| SchedulerError::Unknown(e.to_string()))?;
            }

            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image = Some(DockerImage::new(&id));
            }
        }

        output
            .flush()
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        let image = image.ok_or_else(|| {
            SchedulerError::Unknown("build finished without the daemon reporting an image".into())
        })?;

        on_event(ImageBuildEvent::BuildComplete(image.clone()));
        Ok(image)
    }
}

#[async_trait]
impl super::Scheduler for DockerScheduler {
    async fn build_image(
        &self,
        request: BuildImageRequest,
        output: &mut (dyn AsyncWrite + Send + Unpin),
        on_event: &(dyn Fn(ImageBuildEvent) + Send + Sync),
    ) -> Result<DockerImage, SchedulerError> {
        let context = build_context(&request.context_directory).await?;

        debug!(
            parent: &self.span,
            tag = %request.tag,
            context = %request.context_directory.display(),
            context_bytes = context.len(),
            buildkit = self.buildkit,
            "Building image"
        );

        if self.buildkit {
            self.build_with_buildkit(request, context, output, on_event)
                .await
        } else {
            self.build_with_legacy_builder(request, context, output, on_event)
                .await
        }
    }

    async fn pull_image(&self, image: &str) -> Result<DockerImage, SchedulerError> {
        self.client
            .create_image(
                Some(bollard::image::CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SchedulerError::NoSuchImage(format!("{image}; {e}")))?;

        let inspected = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| SchedulerError::NoSuchImage(format!("{image}; {e}")))?;

        debug!(parent: &self.span, image, "Pulled image");

        Ok(DockerImage::new(
            &inspected.id.unwrap_or_else(|| image.to_string()),
        ))
    }

    async fn start_container(
        &self,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse, SchedulerError> {
        // Remove any leftover container of the same name from an earlier run.
        if let Err(e) = self
            .client
            .remove_container(
                &request.name,
                Some(bollard::container::RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            trace!(parent: &self.span, container_name = &request.name, err = ?e, "could not remove previous container");
        }

        let container_config = bollard::container::Config {
            image: Some(request.image.clone()),
            cmd: request.command.clone(),
            env: Some(
                request
                    .environment
                    .iter()
                    .map(|(key, value)| format_env_var(key, value))
                    .collect(),
            ),
            working_dir: request.working_directory.clone(),
            ..Default::default()
        };

        let created_container = self
            .client
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: request.name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        self.client
            .start_container::<String>(&request.name, None)
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        debug!(parent: &self.span, container_name = &request.name, image = &request.image, "Started container");

        Ok(StartContainerResponse {
            scheduler_id: created_container.id,
        })
    }

    async fn wait_container(&self, name: &str) -> Result<i64, SchedulerError> {
        let waits = self
            .client
            .wait_container(name, None::<bollard::container::WaitContainerOptions<String>>);
        tokio::pin!(waits);

        // Non-zero exits surface as errors here, so the exit code is read from the container afterwards.
        while let Some(result) = waits.next().await {
            if let Err(e) = result {
                trace!(parent: &self.span, container_name = name, err = %e, "Wait for container ended");
                break;
            }
        }

        let container_info = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()))?;

        container_info
            .state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| {
                SchedulerError::Unknown(format!("container {name} has no exit code"))
            })
    }

    async fn stop_container(&self, request: StopContainerRequest) -> Result<(), SchedulerError> {
        self.client
            .stop_container(
                &request.name,
                Some(bollard::container::StopContainerOptions { t: request.timeout }),
            )
            .await
            .map_err(|e| SchedulerError::Unknown(e.to_string()))?;

        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), SchedulerError> {
        self.client
            .remove_container(
                name,
                Some(bollard::container::RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()))?;

        Ok(())
    }

    fn get_logs(
        &self,
        request: GetLogsRequest,
    ) -> Pin<Box<dyn Stream<Item = Result<Log, SchedulerError>> + Send>> {
        let logs_options = bollard::container::LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let logs = self.client.logs(&request.name, Some(logs_options));

        let logs = logs
            .map_ok(|log| match log {
                bollard::container::LogOutput::StdOut { message } => Log::Stdout(message),
                bollard::container::LogOutput::StdErr { message } => Log::Stderr(message),
                _ => Log::Unknown,
            })
            .map_err(|e| SchedulerError::NoSuchContainer(e.to_string()));

        Box::pin(logs)
    }
}
