use thiserror::Error;

/// Failure to obtain candles from a market data source
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Exchange error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No candles returned for {symbol} ({interval})")]
    Empty { symbol: String, interval: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptimizeError {
    #[error("No trial produced a valid result")]
    NoValidTrial,

    #[error("Invalid search range: {0}")]
    InvalidRange(String),
}
