//! Decoding of `moby.buildkit.trace` payloads.
//!
//! The payload is a base64 encoded `moby.buildkit.v1.StatusResponse` message from BuildKit's control API.
//! Only the parts of the message needed to follow build progress are declared below; anything else in the
//! payload is skipped by the protobuf decoder.

use base64::{engine::general_purpose::STANDARD, Engine};
use prost::Message;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("trace payload is not valid base64; {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("trace payload is not a valid BuildKit status message; {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Wire representations of BuildKit's status messages.
pub(crate) mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StatusResponse {
        #[prost(message, repeated, tag = "1")]
        pub vertexes: Vec<Vertex>,
        #[prost(message, repeated, tag = "2")]
        pub statuses: Vec<VertexStatus>,
        #[prost(message, repeated, tag = "3")]
        pub logs: Vec<VertexLog>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Vertex {
        #[prost(string, tag = "1")]
        pub digest: String,
        #[prost(string, repeated, tag = "2")]
        pub inputs: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(bool, tag = "4")]
        pub cached: bool,
        #[prost(message, optional, tag = "5")]
        pub started: Option<Timestamp>,
        #[prost(message, optional, tag = "6")]
        pub completed: Option<Timestamp>,
        #[prost(string, tag = "7")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VertexStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub vertex: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(int64, tag = "4")]
        pub current: i64,
        #[prost(int64, tag = "5")]
        pub total: i64,
        #[prost(message, optional, tag = "6")]
        pub timestamp: Option<Timestamp>,
        #[prost(message, optional, tag = "7")]
        pub started: Option<Timestamp>,
        #[prost(message, optional, tag = "8")]
        pub completed: Option<Timestamp>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VertexLog {
        #[prost(string, tag = "1")]
        pub vertex: String,
        #[prost(message, optional, tag = "2")]
        pub timestamp: Option<Timestamp>,
        #[prost(int64, tag = "3")]
        pub stream: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub msg: Vec<u8>,
    }

    /// google.protobuf.Timestamp
    #[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
    pub struct Timestamp {
        #[prost(int64, tag = "1")]
        pub seconds: i64,
        #[prost(int32, tag = "2")]
        pub nanos: i32,
    }

    impl Timestamp {
        /// Time since the unix epoch. Pre-epoch timestamps are clamped to the epoch.
        pub fn since_epoch(&self) -> std::time::Duration {
            std::time::Duration::new(
                u64::try_from(self.seconds).unwrap_or_default(),
                u32::try_from(self.nanos.clamp(0, 999_999_999)).unwrap_or_default(),
            )
        }
    }
}

/// A single decoded update about a vertex of the build graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexRecord {
    /// Declares a vertex. Repeated for every update the daemon sends about it.
    VertexInfo { id: String, name: String },

    /// The vertex has started executing. `started` is measured from the unix epoch.
    VertexStarted { id: String, started: Duration },

    /// The vertex finished, either from cache, normally or with an error.
    VertexCompleted {
        id: String,
        cached: bool,
        error: Option<String>,
    },

    /// Progress of a sub-operation of a vertex, such as resolving an image or exporting layers.
    VertexStatus {
        vertex_id: String,
        status_text: String,
        current: i64,
        total: i64,
        started: bool,
        completed: bool,
    },

    /// Output written by the process a vertex runs.
    VertexLog {
        vertex_id: String,
        timestamp: Duration,
        data: Vec<u8>,
    },
}

/// Decodes one base64 trace payload into vertex records.
///
/// Records come out in payload order with vertex updates first, then statuses, then logs; the daemon
/// relies on that order since statuses and logs refer to vertices declared before them. Records without
/// a vertex id are dropped.
pub fn decode(payload: &str) -> Result<Vec<VertexRecord>, DecodeError> {
    let raw = STANDARD.decode(payload.trim())?;
    let response = proto::StatusResponse::decode(raw.as_slice())?;

    Ok(into_records(response))
}

fn into_records(response: proto::StatusResponse) -> Vec<VertexRecord> {
    let mut records = Vec::new();

    for vertex in response.vertexes {
        if vertex.digest.is_empty() {
            continue;
        }

        records.push(VertexRecord::VertexInfo {
            id: vertex.digest.clone(),
            name: vertex.name,
        });

        if let Some(started) = vertex.started {
            records.push(VertexRecord::VertexStarted {
                id: vertex.digest.clone(),
                started: started.since_epoch(),
            });
        }

        if vertex.completed.is_some() {
            records.push(VertexRecord::VertexCompleted {
                id: vertex.digest,
                cached: vertex.cached,
                error: (!vertex.error.is_empty()).then_some(vertex.error),
            });
        }
    }

    for status in response.statuses {
        if status.vertex.is_empty() {
            continue;
        }

        let status_text = if status.id.is_empty() {
            status.name
        } else {
            status.id
        };

        records.push(VertexRecord::VertexStatus {
            vertex_id: status.vertex,
            status_text,
            current: status.current,
            total: status.total,
            started: status.started.is_some(),
            completed: status.completed.is_some(),
        });
    }

    for log in response.logs {
        if log.vertex.is_empty() {
            continue;
        }

        records.push(VertexRecord::VertexLog {
            vertex_id: log.vertex,
            timestamp: log.timestamp.map(|t| t.since_epoch()).unwrap_or_default(),
            data: log.msg,
        });
    }

    records
}
