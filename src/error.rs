use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("endpoint {0} has no addresses")]
    NoAddress(String),

    #[error("relay stream to {0} is closed")]
    StreamClosed(String),

    #[error("pod {0} is already bound")]
    AlreadyBound(String),

    #[error("failed to parse nodes file {path}: {source}")]
    NodesFile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("gRPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;
