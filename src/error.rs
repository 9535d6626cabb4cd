use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The video behind a session could not be opened or probed.
    #[error("video unreadable at {path}: {reason}")]
    VideoUnreadable { path: PathBuf, reason: String },

    /// A single prompt point was rejected. The rest of the batch is unaffected.
    #[error("invalid prompt for frame {frame_index}, object {object_id}: {reason}")]
    InvalidPrompt {
        frame_index: usize,
        object_id: u32,
        reason: String,
    },

    /// Propagation or submission attempted before the engine was bound to a video.
    #[error("session not initialized: no engine state bound")]
    SessionNotInitialized,

    /// No session with this id in the registry.
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// A propagation is already in flight for this session.
    #[error("session busy: a propagation is already in flight")]
    SessionBusy,

    /// A mask tensor disagreed with the video geometry or the tracked object set.
    #[error("mask shape mismatch: {0}")]
    MaskShape(String),

    /// The segmentation engine failed. The current propagation is aborted and
    /// the session must be reset before the next one.
    #[error("segmentation engine failure: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ort::Error> for Error {
    fn from(err: ort::Error) -> Self {
        Error::Engine(err.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::MaskShape(err.to_string())
    }
}
