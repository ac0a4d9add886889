//! Errors raised before any GPU work starts.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The window or its raw handles could not be obtained.
    #[error("window: {0}")]
    Window(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A command-line or file setting is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
