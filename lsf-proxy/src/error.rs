use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("decoding url error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("decoded url is not valid UTF-8")]
    NotUtf8,

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("too many redirections")]
    TooManyRedirections,

    #[error("no redirect location")]
    MissingLocation,

    #[error("invalid redirect location: {0}")]
    InvalidLocation(String),

    #[error("upstream responded {0}")]
    UpstreamStatus(reqwest::StatusCode),

    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("decode m3u8 file error")]
    PlaylistDecode,

    #[error("encode m3u8 file error: {0}")]
    PlaylistEncode(#[from] std::io::Error),

    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl Error {
    pub(crate) fn invalid_url(url: &str, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
