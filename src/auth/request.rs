//! Minimal inbound request model for authentication
//!
//! Strategies may need the body (signed requests hash it), but the handler
//! behind them needs it too, so reading is non-destructive: the first read
//! buffers the stream and leaves the buffered bytes in place. A read that
//! fails partway poisons the body so nobody later sees a truncated stream.

use std::io::{self, Read};

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::HeaderMap;

/// Request body, either already in memory or still a stream
pub enum Body {
    /// Bytes already read
    Buffered(Bytes),
    /// Stream not yet consumed
    Reader(Box<dyn Read + Send>),
    /// Stream failed partway; the bytes read so far were discarded
    Failed(io::ErrorKind),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Body::Reader(_) => f.write_str("Reader(..)"),
            Body::Failed(kind) => f.debug_tuple("Failed").field(kind).finish(),
        }
    }
}

/// Headers plus body of an inbound request
#[derive(Debug)]
pub struct HttpRequest {
    /// Request headers
    pub headers: HeaderMap,
    body: Body,
}

impl HttpRequest {
    /// Request with an in-memory body
    pub fn new(headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: Body::Buffered(body.into()),
        }
    }

    /// Request whose body is read lazily
    pub fn streaming(headers: HeaderMap, reader: impl Read + Send + 'static) -> Self {
        Self {
            headers,
            body: Body::Reader(Box::new(reader)),
        }
    }

    /// `Authorization` header, if present and valid UTF-8
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    /// Read the full body, leaving it available for later readers
    pub fn read_body(&mut self) -> io::Result<Bytes> {
        let read = match &mut self.body {
            Body::Buffered(bytes) => return Ok(bytes.clone()),
            Body::Failed(kind) => {
                return Err(io::Error::new(*kind, "request body failed to read earlier"))
            }
            Body::Reader(reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).map(|_| Bytes::from(buf))
            }
        };

        match read {
            Ok(bytes) => {
                self.body = Body::Buffered(bytes.clone());
                Ok(bytes)
            }
            Err(e) => {
                self.body = Body::Failed(e.kind());
                Err(e)
            }
        }
    }

    /// Hand the body to the downstream handler
    pub fn into_body(self) -> Body {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn streaming_body_survives_repeated_reads() {
        let mut request =
            HttpRequest::streaming(HeaderMap::new(), std::io::Cursor::new(b"{\"id\":1}".to_vec()));

        assert_eq!(request.read_body().unwrap(), Bytes::from_static(b"{\"id\":1}"));
        assert_eq!(request.read_body().unwrap(), Bytes::from_static(b"{\"id\":1}"));

        match request.into_body() {
            Body::Buffered(bytes) => assert_eq!(bytes, Bytes::from_static(b"{\"id\":1}")),
            other => panic!("body should be buffered after read, got {other:?}"),
        }
    }

    /// Yields a few bytes, then the connection drops
    struct Truncated {
        sent: bool,
    }

    impl Read for Truncated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.sent = true;
            buf[..3].copy_from_slice(b"{\"a");
            Ok(3)
        }
    }

    #[test]
    fn failed_read_poisons_the_body() {
        let mut request = HttpRequest::streaming(HeaderMap::new(), Truncated { sent: false });

        let first = request.read_body().unwrap_err();
        assert_eq!(first.kind(), io::ErrorKind::ConnectionReset);

        let again = request.read_body().unwrap_err();
        assert_eq!(again.kind(), io::ErrorKind::ConnectionReset);

        assert!(matches!(
            request.into_body(),
            Body::Failed(io::ErrorKind::ConnectionReset)
        ));
    }

    #[test]
    fn authorization_header_lookup() {
        let mut headers = HeaderMap::new();
        assert!(HttpRequest::new(headers.clone(), "").authorization().is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        assert_eq!(HttpRequest::new(headers, "").authorization(), Some("Bearer t"));
    }
}
