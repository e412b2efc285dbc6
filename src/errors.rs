use std::io;

use thiserror::Error;

use crate::block_cache::BlockKey;

#[cfg(feature = "ndarray")]
use ndarray::ShapeError;

pub type Result<T> = std::result::Result<T, Jp2Error>;

#[derive(Debug, Error)]
pub enum Jp2Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot open '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Codec setup failed: {0}")]
    CodecSetup(String),
    #[error("Unable to read codestream header: {0}")]
    HeaderUnreadable(String),
    #[error("Resolution factor {level} rejected: {msg}")]
    ResolutionRejected { level: usize, msg: String },
    #[error("Decode window ({x0}, {y0})-({x1}, {y1}) rejected: {msg}")]
    DecodeWindowRejected {
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
        msg: String,
    },
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Unable to handle that image: {0}")]
    UnsupportedLayout(String),
    #[error("Cannot allocate {size} bytes for block {key:?}")]
    BlockAllocation { key: BlockKey, size: usize },
    #[error("Bad argument: {0}")]
    BadArgument(String),
    #[cfg(feature = "ndarray")]
    #[error(transparent)]
    NdarrayShapeError(#[from] ShapeError),
}
