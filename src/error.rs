//! Error types for archive conversion.

use thiserror::Error;

/// Errors that can occur while converting an archive.
///
/// Every variant aborts the whole conversion; there is no partial output.
#[derive(Error, Debug)]
pub enum Error {
    /// The script-mapping tables could not be loaded.
    #[error("text converter failed to initialize: {0}")]
    ConverterInit(String),

    /// Text conversion was requested before [`TextConverter::initialize`](crate::TextConverter::initialize).
    #[error("text converter used before initialization")]
    NotInitialized,

    /// The input is not a readable archive, or one of its members is damaged.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// The output archive could not be assembled.
    #[error("failed to write archive: {0}")]
    Write(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task failed or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptArchive(msg.into())
    }

    pub(crate) fn write(msg: impl Into<String>) -> Self {
        Error::Write(msg.into())
    }

    /// Whether the failure was caused by the input rather than by this system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::CorruptArchive(_))
    }

    /// A message safe to show to untrusted callers.
    ///
    /// `Display` carries the full detail and should only go to local logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::CorruptArchive(_) => "the uploaded file is not a valid EPUB archive",
            Error::ConverterInit(_) | Error::NotInitialized => "the text converter is unavailable",
            Error::Write(_) => "the converted archive could not be written",
            Error::Io(_) | Error::Internal(_) => "an unexpected error occurred",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
