use std::path::PathBuf;

/// Result type used throughout the crate, wrapping [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No known layout matched the header and no explicit column mapping was supplied.
    #[error("could not recognize the file layout from header `{0}`")]
    UnrecognizedFormat(String),

    /// A single line failed to normalize into a record.
    #[error("{message}")]
    LineParse { message: String, line: String },

    /// A filter, transform or lookup failed. Never suppressed by `skip_errors`.
    #[error("pipeline stage {stage} failed: {source}")]
    PipelineStage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// Positional indexing was requested for input that is not sorted (or not indexable).
    #[error("cannot build positional index: {0}")]
    Indexing(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Skip-errors mode gave up after this many rejected lines.
    #[error("too many lines failed to parse ({count}); stopping")]
    TooManyBadLines { count: usize },

    #[error("no tabix index found at {0}")]
    MissingIndex(PathBuf),

    #[error("invalid tabix index: {0}")]
    InvalidIndex(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Compression(#[from] niffler::Error),
}

impl Error {
    pub(crate) fn line_parse<M: Into<String>>(message: M, line: &str) -> Self {
        Error::LineParse {
            message: message.into(),
            line: line.to_owned(),
        }
    }

    pub(crate) fn config<M: Into<String>>(message: M) -> Self {
        Error::Configuration(message.into())
    }
}
