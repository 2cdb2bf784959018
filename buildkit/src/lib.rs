//! Interprets the response stream the Docker daemon produces while building an image with BuildKit.
//!
//! The daemon answers a build request with newline delimited JSON. Most of the interesting content is
//! hidden inside `moby.buildkit.trace` records, whose `aux` field is a base64 encoded protobuf status
//! message describing the vertices (steps) of the build graph. This crate turns that stream into two
//! things: a sequence of [`ImageBuildEvent`]s for programmatic consumers and a plain text progress
//! rendering in the same format the docker CLI uses for `--progress=plain`.
//!
//! ```ignore
//! let body = ImageBuildResponseBody::new(tracing::info_span!("build", container = "app"));
//! body.process(response, &mut stdout, |event| println!("{event:?}"), &CancellationToken::new())
//!     .await?;
//! ```

pub mod body;
pub mod event;
pub mod render;
pub mod trace;
pub mod tracker;

pub use body::{ImageBuildResponseBody, ResponseBodyError};
pub use event::{ActiveImageBuildStep, DockerImage, ImageBuildEvent};
pub use render::ProgressRenderer;
pub use trace::{DecodeError, VertexRecord};
pub use tracker::{BuildStep, StepStatus, StepTracker};
