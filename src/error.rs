use thiserror::Error;

use crate::bus::topic::TopicError;

/// Errors raised by the message bus wrapper and its transports.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("already connected to the broker")]
    AlreadyConnected,

    #[error("not connected to the broker")]
    NotConnected,

    #[error("transport still reports a connection after disconnect")]
    DisconnectFailed,

    #[error("cannot publish to wildcard topic {0}")]
    NotPublishable(String),

    #[error("{0} is not a declared dependency")]
    UndeclaredDependency(String),

    #[error("request to {daemon}/{request} timed out")]
    Timeout { daemon: String, request: String },

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("response channel closed before a response arrived")]
    ResponseDropped,

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-level error for everything that is not bus plumbing.
#[derive(Error, Debug)]
pub enum AstoriaError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AstoriaError>;
