use crate::{Stage, StatusCode, Version};
use std::{error, fmt, io};
use thiserror::Error;

/// Boxed error type carried by page and loader failures.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while a request travels through the pipeline.
///
/// The variants follow the failure classes of the pipeline:
/// - [`MalformedRequest`](Error::MalformedRequest): the client sent bytes that
///   are not a valid request. Answered with a `4xx` and the connection is closed.
/// - [`Transport`](Error::Transport): the stream failed, timed out or closed
///   early. Fatal to the request, nothing is sent back.
/// - [`PageLoad`](Error::PageLoad) / [`NotFound`](Error::NotFound): the loader
///   could not produce a page.
/// - [`OutOfMemory`](Error::OutOfMemory): the request arena is exhausted.
///
/// Whatever the variant, the page completion callback still fires exactly once.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] Malformed),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("failed to load page `{path}`: {source}")]
    PageLoad {
        path: String,
        #[source]
        source: BoxError,
    },

    #[error("page not found: `{0}`")]
    NotFound(String),

    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("response headers were already sent")]
    HeadersSent,

    #[error("invalid response header field `{0}`")]
    InvalidResponseHeader(String),

    #[error("operation not allowed during the {0:?} stage")]
    InvalidStage(Stage),

    #[error("stale or foreign arena handle")]
    StaleHandle,

    #[error("page error: {0}")]
    Page(#[source] BoxError),
}

impl Error {
    /// Wraps an arbitrary page failure.
    #[inline]
    pub fn page<E: Into<BoxError>>(err: E) -> Self {
        Error::Page(err.into())
    }

    /// Wraps a loader failure for `path`.
    #[inline]
    pub fn page_load<P: Into<String>, E: Into<BoxError>>(path: P, err: E) -> Self {
        Error::PageLoad {
            path: path.into(),
            source: err.into(),
        }
    }

    /// Status used for the best-effort error response.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(kind) => kind.status(),
            Error::NotFound(_) => StatusCode::NotFound,
            Error::Transport(_)
            | Error::PageLoad { .. }
            | Error::OutOfMemory { .. }
            | Error::HeadersSent
            | Error::InvalidResponseHeader(_)
            | Error::InvalidStage(_)
            | Error::StaleHandle
            | Error::Page(_) => StatusCode::InternalServerError,
        }
    }

    /// `true` when the error is the client's fault.
    #[inline]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Error::MalformedRequest(_))
    }

    /// `true` when the stream is unusable and no response must be attempted.
    #[inline]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    #[inline]
    pub(crate) fn stream_cap(what: &'static str) -> Self {
        Error::Transport(io::Error::new(io::ErrorKind::InvalidData, what))
    }

    #[inline]
    pub(crate) fn unexpected_eof() -> Self {
        Error::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed before the request was complete",
        ))
    }
}

/// Reasons a request is rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Malformed {
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    UnsupportedVersion,

    InvalidHeader,
    InvalidContentLength,
    InvalidConnection,
    InvalidEncoding,

    BodyTooLarge,
}

macro_rules! http_errors {
    ($($name:ident: $status:ident, $status_line:literal, $len:literal => $text:literal; )*) => {
        /// Status code of the canned response.
        pub const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name => StatusCode::$status,
            )* }
        }

        /// Complete canned response for this error, `Connection: close` included.
        pub const fn as_http(&self, version: Version) -> &'static [u8] {
            match (self, version) { $(
                (Self::$name, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Type: text/plain; charset=UTF-8\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "\r\n",
                    $text
                ),
                (Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_line, "\r\n",
                    "Connection: close\r\n",
                    "Content-Type: text/plain; charset=UTF-8\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "\r\n",
                    $text
                ),
            )* }.as_bytes()
        }
    };
}

impl Malformed {
    http_errors! {
        InvalidMethod: BadRequest, "400 Bad Request", "19"
            => "Invalid HTTP method";
        InvalidUrl: BadRequest, "400 Bad Request", "18"
            => "Invalid URL format";
        InvalidVersion: BadRequest, "400 Bad Request", "20"
            => "Invalid HTTP version";
        UnsupportedVersion: HttpVersionNotSupported, "505 HTTP Version Not Supported", "26"
            => "HTTP version not supported";

        InvalidHeader: BadRequest, "400 Bad Request", "21"
            => "Invalid header format";
        InvalidContentLength: BadRequest, "400 Bad Request", "22"
            => "Invalid Content-Length";
        InvalidConnection: BadRequest, "400 Bad Request", "25"
            => "Invalid Connection header";
        InvalidEncoding: BadRequest, "400 Bad Request", "24"
            => "Invalid request encoding";

        BodyTooLarge: PayloadTooLarge, "413 Payload Too Large", "22"
            => "Request body too large";
    }
}

impl error::Error for Malformed {}
impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    const ALL: [Malformed; 9] = [
        Malformed::InvalidMethod,
        Malformed::InvalidUrl,
        Malformed::InvalidVersion,
        Malformed::UnsupportedVersion,
        Malformed::InvalidHeader,
        Malformed::InvalidContentLength,
        Malformed::InvalidConnection,
        Malformed::InvalidEncoding,
        Malformed::BodyTooLarge,
    ];

    #[test]
    fn canned_content_length_matches_body() {
        for kind in ALL {
            for version in [Version::Http10, Version::Http11] {
                let text = str_op(kind.as_http(version));
                let (head, body) = text.split_once("\r\n\r\n").unwrap();

                let declared = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .unwrap();

                assert_eq!(declared.parse::<usize>().unwrap(), body.len(), "{kind:?}");
                assert!(head.contains("Connection: close"));
            }
        }
    }

    #[test]
    fn canned_status_line_matches_status() {
        for kind in ALL {
            let text = str_op(kind.as_http(Version::Http11));
            let expected = format!("HTTP/1.1 {} ", kind.status().as_u16());

            assert!(text.starts_with(&expected), "{kind:?}");
        }
    }

    #[test]
    fn error_status() {
        #[rustfmt::skip]
        let cases = [
            (Error::from(Malformed::InvalidHeader),        400),
            (Error::from(Malformed::BodyTooLarge),         413),
            (Error::NotFound("/x".into()),                 404),
            (Error::OutOfMemory { requested: 8, available: 0 }, 500),
            (Error::page("boom"),                          500),
            (Error::page_load("/x", "compile failed"),     500),
            (Error::InvalidResponseHeader("X\r\n".into()),  500),
        ];

        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
        }
    }

    #[test]
    fn classification() {
        assert!(Error::from(Malformed::InvalidUrl).is_client_error());
        assert!(Error::unexpected_eof().is_transport());
        assert!(!Error::HeadersSent.is_transport());
    }
}
