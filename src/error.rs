//! Error types for the hardware composer core

use thiserror::Error;

use crate::display::DisplayId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("display {0} is not connected")]
    NoDisplay(DisplayId),

    #[error("display index {0} is out of range")]
    InvalidDisplay(u64),

    #[error("display {dpy} has no config {config}")]
    BadConfig { dpy: DisplayId, config: usize },

    #[error("display driver error: {0}")]
    Driver(String),

    #[error("fence wait timed out after {0} ms")]
    FenceTimeout(u64),

    #[error("fence error: {0}")]
    Fence(String),

    #[error("failed to spawn thread: {0}")]
    Thread(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
