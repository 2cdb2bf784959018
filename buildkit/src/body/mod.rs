//! Processing of the newline delimited JSON body the daemon returns for a BuildKit image build.


use crate::event::{ActiveImageBuildStep, DockerImage, ImageBuildEvent};
use crate::render::ProgressRenderer;
use crate::trace::{self, DecodeError};
use crate::tracker::StepTracker;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

const IMAGE_ID_RECORD: &str = "moby.image.id";
const TRACE_RECORD: &str = "moby.buildkit.trace";

#[derive(thiserror::Error, Debug)]
pub enum ResponseBodyError {
    #[error("Received malformed response from Docker daemon during build: {content}")]
    MalformedResponse { content: String },

    #[error("Received malformed response from Docker daemon during build: {content}")]
    MalformedTrace {
        content: String,
        #[source]
        source: DecodeError,
    },

    #[error("Processing of the build response was cancelled")]
    Cancelled,

    #[error("Could not read build response or write build output; {0}")]
    Io(#[from] std::io::Error),
}

impl ResponseBodyError {
    fn malformed(line: &str) -> Self {
        Self::MalformedResponse {
            content: quoted(line),
        }
    }
}

/// A line without its `\n` or `\r\n` terminator.
fn line_content(buffer: &[u8]) -> &[u8] {
    let line = buffer.strip_suffix(b"\n").unwrap_or(buffer);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn quoted(line: &str) -> String {
    serde_json::Value::String(line.to_string()).to_string()
}

#[derive(Deserialize, Debug, Default)]
struct ResponseLine {
    id: Option<String>,
    aux: Option<serde_json::Value>,
    stream: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorDetail {
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ImageIdAux {
    #[serde(rename = "ID")]
    id: String,
}

/// Per-stream state. Every build gets its own.
struct BuildState {
    tracker: StepTracker,
    renderer: ProgressRenderer,
    last_active: Vec<ActiveImageBuildStep>,
    terminated: bool,
}

impl BuildState {
    fn emit<F: FnMut(ImageBuildEvent)>(&mut self, on_event: &mut F, event: ImageBuildEvent) {
        if self.terminated {
            return;
        }

        self.terminated = event.is_terminal();
        on_event(event);
    }
}

/// Interprets a BuildKit build response.
#[derive(Debug, Clone)]
pub struct ImageBuildResponseBody {
    span: Span,
    stream_passthrough: bool,
}

impl ImageBuildResponseBody {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            stream_passthrough: false,
        }
    }

    /// Copy `stream` text the daemon sends (such as "Successfully tagged ...") to the output as is.
    /// Without this it is only logged.
    pub fn with_stream_passthrough(mut self, enabled: bool) -> Self {
        self.stream_passthrough = enabled;
        self
    }

    /// Reads the response line by line, writing plain progress text to `output` and reporting events
    /// to `on_event` as they happen.
    ///
    /// A build failure reported by the daemon is delivered as [`ImageBuildEvent::BuildError`]; an error is
    /// only returned if the response itself can't be understood, reading or writing fails, or `cancel` is
    /// triggered.
    pub async fn process<R, W, F>(
        &self,
        mut input: R,
        output: &mut W,
        mut on_event: F,
        cancel: &CancellationToken,
    ) -> Result<(), ResponseBodyError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + ?Sized,
        F: FnMut(ImageBuildEvent),
    {
        let mut state = BuildState {
            tracker: StepTracker::new(self.span.clone()),
            renderer: ProgressRenderer::new(),
            last_active: vec![],
            terminated: false,
        };

        let mut buffer = Vec::new();

        loop {
            buffer.clear();

            let read = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(parent: &self.span, "Build response processing cancelled");
                    return Err(ResponseBodyError::Cancelled);
                }
                read = input.read_until(b'\n', &mut buffer) => read?,
            };

            if read == 0 {
                break;
            }

            let content = line_content(&buffer);
            let line = std::str::from_utf8(content)
                .map_err(|_| ResponseBodyError::malformed(&String::from_utf8_lossy(content)))?;

            let text = self.process_line(line, &mut state, &mut on_event)?;
            if !text.is_empty() {
                output.write_all(text.as_bytes()).await?;
                output.flush().await?;
            }
        }

        let remaining = state.renderer.render(&mut state.tracker, true);
        if !remaining.is_empty() {
            output.write_all(remaining.as_bytes()).await?;
        }
        output.flush().await?;

        Ok(())
    }

    /// Handles one line of the response and returns the output it produced.
    fn process_line<F: FnMut(ImageBuildEvent)>(
        &self,
        line: &str,
        state: &mut BuildState,
        on_event: &mut F,
    ) -> Result<String, ResponseBodyError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|_| ResponseBodyError::malformed(line))?;
        if !value.is_object() {
            return Err(ResponseBodyError::malformed(line));
        }
        let record = ResponseLine::deserialize(value).map_err(|_| ResponseBodyError::malformed(line))?;

        let error_message = record
            .error_detail
            .and_then(|detail| detail.message)
            .or(record.error);

        if let Some(message) = error_message {
            debug!(parent: &self.span, error = %message, "Daemon reported build failure");
            state.emit(on_event, ImageBuildEvent::BuildError(message));
            return Ok(String::new());
        }

        match record.id.as_deref() {
            Some(IMAGE_ID_RECORD) => {
                let aux = record.aux.ok_or_else(|| ResponseBodyError::malformed(line))?;
                let image: ImageIdAux =
                    serde_json::from_value(aux).map_err(|_| ResponseBodyError::malformed(line))?;

                debug!(parent: &self.span, image = %image.id, "Image built");
                state.emit(
                    on_event,
                    ImageBuildEvent::BuildComplete(DockerImage::new(&image.id)),
                );
                Ok(String::new())
            }
            Some(TRACE_RECORD) => {
                let payload = record
                    .aux
                    .as_ref()
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| ResponseBodyError::malformed(line))?;

                let records =
                    trace::decode(payload).map_err(|source| ResponseBodyError::MalformedTrace {
                        content: quoted(line),
                        source,
                    })?;

                for record in records {
                    state.tracker.apply(record);
                }

                let text = state.renderer.render(&mut state.tracker, false);

                let active = state.tracker.active_steps();
                if !active.is_empty() && active != state.last_active {
                    state.emit(on_event, ImageBuildEvent::BuildProgress(active.clone()));
                }
                state.last_active = active;

                Ok(text)
            }
            _ => match record.stream {
                Some(stream) if self.stream_passthrough => Ok(stream),
                Some(stream) => {
                    debug!(parent: &self.span, output = %stream.trim_end(), "Daemon output");
                    Ok(String::new())
                }
                None => Ok(String::new()),
            },
        }
    }
}
