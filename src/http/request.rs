use crate::{
    arena::{Arena, PoolStr},
    errors::{Error, Malformed, Result},
    http::{
        headers::{self, HeaderContainer},
        query::{self, Component, Query, StringMap},
        types::{self, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::{memchr, memchr_iter, memmem};
use std::{io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::sleep,
};

/// A parsed request.
///
/// Strings live in the connection's [`Arena`]; the request only holds
/// handles. Resolve them through [`Request::view`] or the accessors taking an
/// arena.
///
/// # Accepted input
///
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: exactly `"\r\n"`, a bare `LF` is not a line terminator
///
/// ## First line
///
/// ```text
/// [METHOD] SP [TARGET] SP [VERSION] CRLF
/// ```
///
/// - `[METHOD]`: see [`Method`]
/// - `[TARGET]`: must start with `/`. Everything after the first `?` is the
///   query string; the rest is the path, which is percent-decoded (`%3F`
///   excepted, so the path never contains `?`).
/// - `[VERSION]`: `HTTP/1.0` or `HTTP/1.1`; other `HTTP/x.y` versions get
///   `505 HTTP Version Not Supported`
///
/// ## Headers
///
/// ```text
/// [NAME] ":" [VALUE] CRLF
/// ```
///
/// The value is trimmed. The block ends with an empty line. Two headers carry
/// semantics:
///
/// | Header           | Purpose                | Values                                              |
/// |------------------|------------------------|-----------------------------------------------------|
/// | `Content-Length` | Body size              | decimal, at most [`ReqLimits::body_size`]           |
/// | `Connection`     | Keep-alive flag        | comma-separated tokens, `close` / `keep-alive` used |
///
/// ## Body
///
/// Only `application/x-www-form-urlencoded` bodies with a `Content-Length`
/// are read, and only when the page asks for it (by default for `POST`).
/// Any other body is left unread and the connection is closed after the
/// response. `Transfer-Encoding` is not supported.
#[derive(Debug)]
pub struct Request {
    method: Method,
    version: Version,

    target: PoolStr,
    path: PoolStr,
    query_string: PoolStr,

    headers: HeaderContainer,
    query: StringMap,
    form: StringMap,

    content_length: Option<usize>,
    pub(crate) keep_alive: bool,
    body_read: bool,
}

impl Request {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Request {
            method: Method::Get,
            version: Version::Http11,

            target: PoolStr::EMPTY,
            path: PoolStr::EMPTY,
            query_string: PoolStr::EMPTY,

            headers: HeaderContainer::with_capacity(limits.header_count.min(32)),
            query: StringMap::default(),
            form: StringMap::default(),

            content_length: None,
            keep_alive: true,
            body_read: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.version = Version::Http11;

        self.target = PoolStr::EMPTY;
        self.path = PoolStr::EMPTY;
        self.query_string = PoolStr::EMPTY;

        self.headers.clear();
        self.query.clear();
        self.form.clear();

        self.content_length = None;
        self.keep_alive = true;
        self.body_read = false;
    }

    /// `true` once nothing of this request is left unread on the stream.
    #[inline]
    pub(crate) fn body_settled(&self) -> bool {
        self.body_read || self.content_length.unwrap_or(0) == 0
    }
}

// Public API
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Decoded path, without the query string.
    #[inline(always)]
    pub const fn path(&self) -> PoolStr {
        self.path
    }

    /// Raw request target as sent, query string included.
    #[inline(always)]
    pub const fn target(&self) -> PoolStr {
        self.target
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderContainer {
        &self.headers
    }

    /// Decoded query string parameters.
    #[inline(always)]
    pub const fn query(&self) -> &StringMap {
        &self.query
    }

    /// Decoded form fields. Empty unless a form body was read.
    #[inline(always)]
    pub const fn form(&self) -> &StringMap {
        &self.form
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// `true` once the form body has been consumed.
    #[inline(always)]
    pub const fn body_read(&self) -> bool {
        self.body_read
    }

    /// Borrows the request together with the arena its strings live in.
    #[inline(always)]
    pub fn view<'a>(&'a self, arena: &'a Arena) -> RequestView<'a> {
        RequestView {
            request: self,
            arena,
        }
    }
}

/// Read-only request accessor with strings resolved.
///
/// Handed to [`Page::render`](crate::Page::render). Handles that no longer
/// resolve read as empty strings or `None`.
#[derive(Clone, Copy)]
pub struct RequestView<'a> {
    request: &'a Request,
    arena: &'a Arena,
}

impl<'a> RequestView<'a> {
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.request.method
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.request.version
    }

    #[inline]
    pub fn path(&self) -> &'a str {
        self.arena.get(self.request.path).unwrap_or_default()
    }

    #[inline]
    pub fn target(&self) -> &'a str {
        self.arena.get(self.request.target).unwrap_or_default()
    }

    /// Raw query string, without the `?`.
    #[inline]
    pub fn query_string(&self) -> &'a str {
        self.arena.get(self.request.query_string).unwrap_or_default()
    }

    /// First value of header `name`, case-insensitive.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.request.headers.get(self.arena, name)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.request.headers.iter(self.arena)
    }

    /// Query parameter `key`, case-sensitive.
    #[inline]
    pub fn query(&self, key: &str) -> Option<&'a str> {
        self.request.query.get(self.arena, key)
    }

    pub fn query_params(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.request.query.iter(self.arena)
    }

    /// Form field `key`, case-sensitive.
    #[inline]
    pub fn form(&self, key: &str) -> Option<&'a str> {
        self.request.form.get(self.arena, key)
    }

    pub fn form_fields(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.request.form.iter(self.arena)
    }

    #[inline(always)]
    pub fn content_length(&self) -> Option<usize> {
        self.request.content_length
    }

    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.request.keep_alive
    }

    #[inline(always)]
    pub fn request(&self) -> &'a Request {
        self.request
    }
}

// PARSER

/// Per-connection read buffer and request parser.
///
/// The buffer is allocated once, `head_size + body_size` bytes. Bytes read
/// past the end of one request (pipelined requests) are kept for the next.
pub(crate) struct Parser {
    buffer: Box<[u8]>,
    /// Bytes currently in `buffer`
    len: usize,
    /// End of the current head, final CRLF included. `0` until a head is found
    head_end: usize,
    /// Bytes of `buffer` already scanned for the head terminator
    scanned: usize,

    head_size: usize,
    header_count: usize,
    body_size: usize,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Parser {
            buffer: vec![0; limits.buffer_size()].into_boxed_slice(),
            len: 0,
            head_end: 0,
            scanned: 0,

            head_size: limits.head_size,
            header_count: limits.header_count,
            body_size: limits.body_size,
        }
    }

    /// Drops the current request from the buffer, keeping any bytes that
    /// follow it.
    pub(crate) fn finish(&mut self, request: &Request) {
        let consumed = match request.body_read {
            true => self.head_end + request.content_length.unwrap_or(0),
            false => self.head_end,
        }
        .min(self.len);

        self.buffer.copy_within(consumed..self.len, 0);
        self.len -= consumed;
        self.head_end = 0;
        self.scanned = 0;
    }

    /// Forgets everything buffered, for a new connection.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.len = 0;
        self.head_end = 0;
        self.scanned = 0;
    }

    /// `true` if bytes of a next request are already buffered.
    #[inline(always)]
    pub(crate) fn has_buffered(&self) -> bool {
        self.len > 0
    }
}

// Stream level
impl Parser {
    /// Reads until a complete head is buffered.
    ///
    /// Returns `Ok(false)` if the peer closed the stream before sending
    /// anything. Exceeding the head caps is a transport error: the head is
    /// never handed to the header parser.
    pub(crate) async fn read_head<S>(&mut self, stream: &mut S, timeout: Duration) -> Result<bool>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        loop {
            let from = self.scanned.saturating_sub(3);
            if let Some(pos) = memmem::find(&self.buffer[from..self.len], b"\r\n\r\n") {
                self.head_end = from + pos + 4;
                if self.head_end > self.head_size {
                    return Err(Error::stream_cap("request head exceeds the size limit"));
                }

                // request line + headers + empty line
                let lines = memchr_iter(b'\n', &self.buffer[..self.head_end]).count();
                if lines > self.header_count + 2 {
                    return Err(Error::stream_cap("request head has too many header lines"));
                }
                return Ok(true);
            }

            self.scanned = self.len;
            if self.len >= self.head_size {
                return Err(Error::stream_cap("request head exceeds the size limit"));
            }

            match self.fill(stream, timeout).await? {
                0 if self.len == 0 => return Ok(false),
                0 => return Err(Error::unexpected_eof()),
                _ => {}
            }
        }
    }

    /// Makes sure `len` body bytes following the head are buffered.
    async fn read_body<S>(&mut self, stream: &mut S, len: usize, timeout: Duration) -> Result<()>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let need = self.head_end + len;

        while self.len < need {
            if self.fill(stream, timeout).await? == 0 {
                return Err(Error::unexpected_eof());
            }
        }

        Ok(())
    }

    async fn fill<S>(&mut self, stream: &mut S, time: Duration) -> Result<usize>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        if self.len == self.buffer.len() {
            return Err(Error::stream_cap("request buffer is full"));
        }

        tokio::select! {
            biased;

            read_result = stream.read(&mut self.buffer[self.len..]) => {
                let n = read_result?;
                self.len += n;
                Ok(n)
            }
            _ = sleep(time) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout").into())
            },
        }
    }
}

// Head parsing
impl Parser {
    /// Parses the buffered head into `request`, interning strings in `arena`.
    pub(crate) fn parse_head(&self, request: &mut Request, arena: &mut Arena) -> Result<()> {
        let head = &self.buffer[..self.head_end];

        simdutf8::basic::from_utf8(head).map_err(|_| Malformed::InvalidEncoding)?;

        let line_end = memmem::find(head, b"\r\n").ok_or(Malformed::InvalidVersion)?;
        self.parse_first_line(&head[..line_end], request, arena)?;

        // Everything up to the terminating empty line
        let block = &head[line_end + 2..head.len() - 2];
        let mut start = 0;
        while start < block.len() {
            let end = memmem::find(&block[start..], b"\r\n")
                .map(|pos| start + pos)
                .ok_or(Malformed::InvalidHeader)?;

            let line = &block[start..end];
            if memchr(b'\n', line).is_some() {
                return Err(Malformed::InvalidHeader.into());
            }

            let (name, value) = headers::parse_line(line)?;
            self.parse_header(request, name, value)?;

            let name = arena.intern_bytes(name)?;
            let value = arena.intern_bytes(value)?;
            request.headers.append(name, value);

            start = end + 2;
        }

        tracing::debug!(
            method = %request.method,
            path = arena.get(request.path).unwrap_or_default(),
            headers = request.headers.len(),
            query = request.query.len(),
            "request head parsed"
        );

        Ok(())
    }

    fn parse_first_line(&self, line: &[u8], request: &mut Request, arena: &mut Arena) -> Result<()> {
        let (method, method_len) = Method::from_bytes(line)?;
        let rest = &line[method_len..];

        let target_end = memchr(b' ', rest).ok_or(Malformed::InvalidVersion)?;
        let target = &rest[..target_end];
        if target.first() != Some(&b'/') || target.iter().any(u8::is_ascii_control) {
            return Err(Malformed::InvalidUrl.into());
        }

        let (version, keep_alive) = Version::from_bytes(&rest[target_end + 1..])?;

        let (path, query_string) = match memchr(b'?', target) {
            Some(index) => (&target[..index], &target[index + 1..]),
            None => (target, &b""[..]),
        };

        request.method = method;
        request.version = version;
        request.keep_alive = keep_alive;

        request.target = arena.intern_bytes(target)?;
        request.path = query::intern_decoded(arena, path, Component::Path)?;
        request.query_string = arena.intern_bytes(query_string)?;
        Query::parse_into(&mut request.query, query_string, arena)?;

        Ok(())
    }

    fn parse_header(&self, request: &mut Request, name: &[u8], value: &[u8]) -> Result<()> {
        if name.eq_ignore_ascii_case(b"content-length") {
            let len = types::slice_to_usize(value).ok_or(Malformed::InvalidContentLength)?;

            if request.content_length.is_some_and(|prev| prev != len) {
                return Err(Malformed::InvalidContentLength.into());
            }
            if len > self.body_size {
                return Err(Malformed::BodyTooLarge.into());
            }
            request.content_length = Some(len);
        } else if name.eq_ignore_ascii_case(b"connection") {
            let mut tokens = value
                .split(|b| *b == b',')
                .map(headers::trim)
                .filter(|token| !token.is_empty())
                .peekable();

            if tokens.peek().is_none() {
                return Err(Malformed::InvalidConnection.into());
            }
            for token in tokens {
                if token.eq_ignore_ascii_case(b"close") {
                    request.keep_alive = false;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    request.keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            // Unsupported framing, the body can't be skipped reliably
            request.keep_alive = false;
        }

        Ok(())
    }
}

// Body parsing
impl Parser {
    /// Reads and decodes an `application/x-www-form-urlencoded` body into
    /// the form map. Other bodies are left on the stream. Runs at most once
    /// per request.
    pub(crate) async fn read_form<S>(
        &mut self,
        stream: &mut S,
        request: &mut Request,
        arena: &mut Arena,
        timeout: Duration,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        if request.body_read {
            return Ok(());
        }

        let is_form = request
            .headers
            .get(arena, "content-type")
            .is_some_and(is_form_urlencoded);
        let len = request.content_length.unwrap_or(0);

        if !is_form {
            tracing::debug!(len, "body is not a form, leaving it unread");
            return Ok(());
        }

        self.read_body(stream, len, timeout).await?;

        let body = &self.buffer[self.head_end..self.head_end + len];
        Query::parse_into(&mut request.form, body, arena)?;
        request.body_read = true;

        tracing::debug!(len, fields = request.form.len(), "form body parsed");
        Ok(())
    }
}

/// `application/x-www-form-urlencoded`, parameters ignored.
fn is_form_urlencoded(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();

    essence.eq_ignore_ascii_case("application/x-www-form-urlencoded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;
    use proptest::prelude::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Parsed {
        parser: Parser,
        request: Request,
        arena: Arena,
    }

    async fn parse_with(limits: &ReqLimits, stream: &mut MockStream) -> Result<Parsed> {
        let mut parser = Parser::new(limits);
        let mut request = Request::new(limits);
        let mut arena = Arena::with_capacity(1024, 64 * 1024);

        assert!(parser.read_head(stream, TIMEOUT).await?);
        parser.parse_head(&mut request, &mut arena)?;

        Ok(Parsed {
            parser,
            request,
            arena,
        })
    }

    async fn parse(raw: &str) -> Result<Parsed> {
        parse_with(&ReqLimits::default(), &mut MockStream::new(raw)).await
    }

    fn malformed(result: Result<Parsed>) -> Malformed {
        match result {
            Err(Error::MalformedRequest(kind)) => kind,
            Err(e) => panic!("expected a malformed request, got {e}"),
            Ok(_) => panic!("expected a malformed request, got a request"),
        }
    }

    #[tokio::test]
    async fn simple_get() {
        let t = parse("GET /foo?a=1&b=2 HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let view = t.request.view(&t.arena);

        assert_eq!(view.method(), Method::Get);
        assert_eq!(view.version(), Version::Http11);
        assert_eq!(view.path(), "/foo");
        assert_eq!(view.target(), "/foo?a=1&b=2");
        assert_eq!(view.query_string(), "a=1&b=2");
        assert_eq!(view.query("a"), Some("1"));
        assert_eq!(view.query("b"), Some("2"));
        assert_eq!(view.header("host"), Some("x"));
        assert!(view.is_keep_alive());
    }

    #[tokio::test]
    async fn request_targets() {
        #[rustfmt::skip]
        let cases: [(&str, &str, &[(&str, &str)]); 7] = [
            ("/",                     "/",          &[]),
            ("/?",                    "/",          &[]),
            ("/a%20b/c+d",            "/a b/c+d",   &[]),
            ("/x%3Fy?z=1",            "/x%3Fy",     &[("z", "1")]),
            ("/s?q=a+b&q=c",          "/s",         &[("q", "a b")]),
            ("/s?k=v=w&&flag",        "/s",         &[("k", "v=w"), ("flag", "")]),
            ("/p??x=1",               "/p",         &[("x", "1")]),
        ];

        for (target, path, params) in cases {
            let t = parse(&format!("GET {target} HTTP/1.1\r\n\r\n")).await.unwrap();
            let view = t.request.view(&t.arena);

            assert_eq!(view.path(), path, "{target}");
            assert_eq!(view.query_params().collect::<Vec<_>>(), params, "{target}");
        }
    }

    #[tokio::test]
    async fn malformed_requests() {
        #[rustfmt::skip]
        let cases = [
            ("get / HTTP/1.1\r\n\r\n",                     Malformed::InvalidMethod),
            ("BREW / HTTP/1.1\r\n\r\n",                    Malformed::InvalidMethod),
            ("GET api HTTP/1.1\r\n\r\n",                   Malformed::InvalidUrl),
            ("GET  / HTTP/1.1\r\n\r\n",                    Malformed::InvalidUrl),
            ("GET /\r\n\r\n",                              Malformed::InvalidVersion),
            ("GET / HTTP/1.1 \r\n\r\n",                    Malformed::InvalidVersion),
            ("GET / HTTP/2.0\r\n\r\n",                     Malformed::UnsupportedVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n",          Malformed::InvalidHeader),
            ("GET / HTTP/1.1\r\nA: b\nC: d\r\n\r\n",       Malformed::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: x\r\n\r\n", Malformed::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
                                                           Malformed::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 999999\r\n\r\n", Malformed::BodyTooLarge),
            ("GET / HTTP/1.1\r\nConnection: ,\r\n\r\n",    Malformed::InvalidConnection),
            ("GET /?x=%FF HTTP/1.1\r\n\r\n",               Malformed::InvalidEncoding),
        ];

        for (raw, expected) in cases {
            assert_eq!(malformed(parse(raw).await), expected, "{raw:?}");
        }

        let mut stream = MockStream::from_bytes(b"GET / HTTP/1.1\r\nX: \xff\r\n\r\n".to_vec());
        assert_eq!(
            malformed(parse_with(&ReqLimits::default(), &mut stream).await),
            Malformed::InvalidEncoding
        );
    }

    #[tokio::test]
    async fn keep_alive_rules() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                              true),
            ("GET / HTTP/1.0\r\n\r\n",                              false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",         false),
            ("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n",    true),
            ("GET / HTTP/1.1\r\nConnection: Upgrade, close\r\n\r\n", false),
            ("GET / HTTP/1.1\r\nConnection: Upgrade\r\n\r\n",       true),
            ("GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", false),
        ];

        for (raw, expected) in cases {
            let t = parse(raw).await.unwrap();
            assert_eq!(t.request.is_keep_alive(), expected, "{raw:?}");
        }
    }

    #[tokio::test]
    async fn head_arrives_in_pieces() {
        let raw = "GET /slow HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n";
        let mut stream = MockStream::new(raw).chunked(3);

        let t = parse_with(&ReqLimits::default(), &mut stream).await.unwrap();
        let view = t.request.view(&t.arena);

        assert_eq!(view.path(), "/slow");
        assert_eq!(view.header("accept"), Some("*/*"));
    }

    #[tokio::test]
    async fn stream_caps_are_transport_errors() {
        let limits = ReqLimits {
            head_size: 64,
            header_count: 2,
            ..ReqLimits::default()
        };

        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(100));
        let many = "GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";

        for raw in [long.as_str(), many] {
            match parse_with(&limits, &mut MockStream::new(raw)).await {
                Err(Error::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
                Err(e) => panic!("expected a transport error, got {e}"),
                Ok(_) => panic!("expected a transport error for {raw:?}"),
            }
        }
    }

    #[tokio::test]
    async fn eof_handling() {
        let limits = ReqLimits::default();
        let mut parser = Parser::new(&limits);

        // Closed before anything was sent
        let mut stream = MockStream::new("");
        assert!(!parser.read_head(&mut stream, TIMEOUT).await.unwrap());

        // Closed in the middle of a head
        let mut stream = MockStream::new("GET / HTTP/1.1\r\nHost");
        assert!(matches!(
            parser.read_head(&mut stream, TIMEOUT).await,
            Err(Error::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn form_body() {
        let raw = "POST /login HTTP/1.1\r\n\
                   Content-Type: Application/X-WWW-Form-Urlencoded; charset=UTF-8\r\n\
                   Content-Length: 27\r\n\r\n\
                   user=j%C3%B6rg&pass=a+b&x=1";
        let mut stream = MockStream::new(raw).chunked(10);
        let mut t = parse_with(&ReqLimits::default(), &mut stream).await.unwrap();

        t.parser
            .read_form(&mut stream, &mut t.request, &mut t.arena, TIMEOUT)
            .await
            .unwrap();
        let view = t.request.view(&t.arena);

        assert!(t.request.body_read());
        assert_eq!(view.form("user"), Some("jörg"));
        assert_eq!(view.form("pass"), Some("a b"));
        assert_eq!(view.form("x"), Some("1"));
        assert!(t.request.body_settled());
    }

    #[tokio::test]
    async fn non_form_body_is_left_unread() {
        let raw = "POST /upload HTTP/1.1\r\n\
                   Content-Type: application/json\r\n\
                   Content-Length: 7\r\n\r\n\
                   {\"a\":1}";
        let mut stream = MockStream::new(raw);
        let mut t = parse_with(&ReqLimits::default(), &mut stream).await.unwrap();

        t.parser
            .read_form(&mut stream, &mut t.request, &mut t.arena, TIMEOUT)
            .await
            .unwrap();

        assert!(!t.request.body_read());
        assert!(t.request.form().is_empty());
        assert!(!t.request.body_settled());
    }

    #[tokio::test]
    async fn truncated_form_body() {
        let raw = "POST / HTTP/1.1\r\n\
                   Content-Type: application/x-www-form-urlencoded\r\n\
                   Content-Length: 20\r\n\r\n\
                   a=1";
        let mut stream = MockStream::new(raw);
        let mut t = parse_with(&ReqLimits::default(), &mut stream).await.unwrap();

        let result = t
            .parser
            .read_form(&mut stream, &mut t.request, &mut t.arena, TIMEOUT)
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn pipelined_requests() {
        let limits = ReqLimits::default();
        let raw = "POST /a HTTP/1.1\r\n\
                   Content-Type: application/x-www-form-urlencoded\r\n\
                   Content-Length: 3\r\n\r\n\
                   k=v\
                   GET /b HTTP/1.1\r\n\r\n";
        let mut stream = MockStream::new(raw);
        let mut t = parse_with(&limits, &mut stream).await.unwrap();

        t.parser
            .read_form(&mut stream, &mut t.request, &mut t.arena, TIMEOUT)
            .await
            .unwrap();
        t.parser.finish(&t.request);
        assert!(t.parser.has_buffered());

        t.request.reset();
        t.arena.reset();

        assert!(t.parser.read_head(&mut stream, TIMEOUT).await.unwrap());
        t.parser.parse_head(&mut t.request, &mut t.arena).unwrap();

        assert_eq!(t.request.view(&t.arena).path(), "/b");
        assert!(t.request.form().is_empty());
    }

    #[test]
    fn form_content_types() {
        #[rustfmt::skip]
        let cases = [
            ("application/x-www-form-urlencoded",                true),
            ("application/x-www-form-urlencoded;charset=UTF-8",  true),
            (" APPLICATION/X-WWW-FORM-URLENCODED ; q=1",         true),
            ("multipart/form-data; boundary=x",                  false),
            ("text/plain",                                       false),
            ("",                                                 false),
        ];

        for (value, expected) in cases {
            assert_eq!(is_form_urlencoded(value), expected, "{value}");
        }
    }

    proptest! {
        #[test]
        fn path_never_contains_question_mark(target in "/[a-zA-Z0-9%?=&+/._-]{0,40}") {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let raw = format!("GET {target} HTTP/1.1\r\n\r\n");

            // Some generated targets decode to invalid UTF-8, those are rejected
            if let Ok(t) = runtime.block_on(parse(&raw)) {
                prop_assert!(!t.request.view(&t.arena).path().contains('?'));
            }
        }
    }
}
