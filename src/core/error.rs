use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::dts::DtsError;

/// Errors surfaced by the RTSP client, before or during a session.
#[derive(Debug, Error)]
pub enum RtspError {
    #[error("invalid stream url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("{method} failed: {status} {reason}")]
    Status {
        method: &'static str,
        status: u16,
        reason: String,
    },
    #[error("authentication rejected by server")]
    Unauthorized,
    #[error("unsupported authentication scheme '{0}'")]
    UnsupportedAuth(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("no H264 video media in session description")]
    NoVideoMedia,
    #[error("malformed session description: {0}")]
    MalformedSdp(String),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("no data received for {0:?}")]
    ReadTimeout(std::time::Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from the segmenting muxer. Any of these ends the recording session.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("create chunk file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write chunk: {0}")]
    Io(#[from] io::Error),
    #[error("decode timestamp: {0}")]
    Dts(#[from] DtsError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl ConfigError {
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
