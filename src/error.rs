use reqwest::StatusCode;

/// Errors produced while opening or consuming a feed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status before the feed body
    /// started streaming.
    #[error("invalid response status {status}: {body}")]
    InvalidResponse { status: StatusCode, body: String },

    #[error("unsupported value for option \"feed\": {0:?}")]
    UnsupportedFeed(String),

    #[error("invalid option {key:?}: {reason}")]
    InvalidOption { key: String, reason: String },

    /// A row or trailer key could not be decoded. Terminates the feed.
    #[error("parsing failed: {error}, json: {json}")]
    ParsingFailed {
        #[source]
        error: serde_json::Error,
        json: String,
    },

    #[error("unexpected token {found:?} in feed body, want {want}")]
    UnexpectedToken { found: String, want: &'static str },

    /// The connection closed in the middle of a poll-mode response body.
    #[error("unexpected end of feed body")]
    UnexpectedEof,
}
