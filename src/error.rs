use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("row {line} has {fields} fields, expected at least 3 (id, source, target)")]
    MalformedRecord { line: u64, fields: usize },

    #[error("unsupported corpus format: {0}")]
    UnsupportedFormat(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("special token {0} is missing from the vocabulary")]
    MissingToken(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("hub error: {0}")]
    Hub(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Download(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// `tokenizers` reports failures as boxed trait objects, which cannot go through `#[from]`.
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
