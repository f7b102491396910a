//! Buffered response with a single-write flush.

use crate::{
    arena::{Arena, PoolStr},
    errors::{Error, Result},
    http::{
        headers::{self, HeaderContainer},
        types::{StatusCode, Version},
    },
    limits::RespLimits,
    BodyWriter, WriteBuffer,
};
use std::{
    io::{self, IoSlice},
    mem,
    time::Duration,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::sleep,
};

/// Response under construction.
///
/// The body is buffered in memory. Headers are stored as arena strings and
/// serialized once, on the first [`flush`](Response::flush), together with
/// the body in a single vectored write.
///
/// Two flags guard the life-cycle:
/// - `headers_written`: set when the head is serialized. Status and header
///   mutations then fail with [`Error::HeadersSent`].
/// - `closed`: set when the flush completed. [`write`](Response::write) then
///   returns `false` and changes nothing.
///
/// # Examples
/// ```
/// use pagecycle::{Arena, Response, StatusCode, limits::RespLimits};
///
/// let mut arena = Arena::with_capacity(256, 4096);
/// let mut resp = Response::new(&RespLimits::default());
///
/// resp.status(StatusCode::Created).unwrap();
/// resp.set_header(&mut arena, "X-Request-Id", "42").unwrap();
/// resp.write("<h1>");
/// resp.write(7);
/// resp.write("</h1>");
///
/// let mut head = Vec::new();
/// resp.serialize_headers(&arena, &mut head);
/// let head = String::from_utf8(head).unwrap();
///
/// assert!(head.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(head.contains("Content-Length: 10\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    body: Vec<u8>,
    head: Vec<u8>,
    headers: HeaderContainer,

    status: u16,
    reason: Reason,

    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    /// Content-Length is announced but the body is not sent (`HEAD`)
    pub(crate) omit_body: bool,

    headers_written: bool,
    closed: bool,
    /// Body bytes already transmitted
    sent: usize,
}

#[derive(Debug, Clone, Copy)]
enum Reason {
    Canonical(StatusCode),
    Custom(PoolStr),
}

impl Response {
    pub fn new(limits: &RespLimits) -> Self {
        Self {
            body: Vec::with_capacity(limits.default_capacity),
            head: Vec::with_capacity(256),
            headers: HeaderContainer::with_capacity(8),

            status: 200,
            reason: Reason::Canonical(StatusCode::Ok),

            version: Version::Http11,
            keep_alive: true,
            omit_body: false,

            headers_written: false,
            closed: false,
            sent: 0,
        }
    }

    /// Prepares the response for the next request. An oversized body buffer
    /// is re-allocated.
    pub fn reset(&mut self, limits: &RespLimits) {
        if self.body.capacity() > limits.max_capacity {
            self.body = Vec::with_capacity(limits.default_capacity);
        } else {
            self.body.clear();
        }
        self.head.clear();
        self.headers.clear();

        self.status = 200;
        self.reason = Reason::Canonical(StatusCode::Ok);

        self.version = Version::Http11;
        self.keep_alive = true;
        self.omit_body = false;

        self.headers_written = false;
        self.closed = false;
        self.sent = 0;
    }

    #[inline(always)]
    fn check_headers(&self) -> Result<()> {
        match self.headers_written {
            true => Err(Error::HeadersSent),
            false => Ok(()),
        }
    }
}

// Body
impl Response {
    /// Appends `value` to the body. Returns `false`, without writing, once
    /// the response is closed.
    #[inline]
    pub fn write<T: WriteBuffer>(&mut self, value: T) -> bool {
        if self.closed {
            return false;
        }
        value.write_to(&mut self.body);
        true
    }

    /// Writer over the body, for `write!` and streaming renderers.
    #[inline]
    pub fn body_writer(&mut self) -> BodyWriter<'_> {
        BodyWriter {
            buffer: &mut self.body,
            closed: self.closed,
        }
    }

    /// Discards the buffered body.
    pub fn clear(&mut self) -> Result<()> {
        self.check_headers()?;
        self.body.clear();
        Ok(())
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

// Status and headers
impl Response {
    /// Sets the status with its canonical reason phrase.
    pub fn status(&mut self, status: StatusCode) -> Result<&mut Self> {
        self.check_headers()?;
        self.status = status.as_u16();
        self.reason = Reason::Canonical(status);
        Ok(self)
    }

    /// Sets a status with a custom reason phrase. A phrase with a line
    /// break is [`Error::InvalidResponseHeader`].
    ///
    /// # Panics
    /// In `debug` mode, if `code` has not three digits.
    #[track_caller]
    pub fn status_with(&mut self, arena: &mut Arena, code: u16, text: &str) -> Result<&mut Self> {
        debug_assert!((100..=999).contains(&code), "Status code must have 3 digits");
        self.check_headers()?;
        if !headers::is_field_value(text) {
            return Err(Error::InvalidResponseHeader(text.to_owned()));
        }

        self.status = code;
        self.reason = Reason::Custom(arena.intern(text)?);
        Ok(self)
    }

    #[inline(always)]
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Reason phrase of the status line.
    pub fn status_text<'a>(&self, arena: &'a Arena) -> &'a str {
        match self.reason {
            Reason::Canonical(status) => status.reason(),
            Reason::Custom(text) => arena.get(text).unwrap_or_default(),
        }
    }

    /// Replaces header `name`, or adds it.
    ///
    /// `name` must be a token and `value` free of line breaks, otherwise
    /// [`Error::InvalidResponseHeader`]. A `Content-Length` set here is
    /// replaced by the body length when the head is serialized.
    pub fn set_header(&mut self, arena: &mut Arena, name: &str, value: &str) -> Result<&mut Self> {
        self.check_headers()?;
        check_field(name, value)?;
        self.headers.set(arena, name, value)?;
        Ok(self)
    }

    /// Adds header `name`, keeping existing ones. Same rules as
    /// [`set_header`](Self::set_header).
    pub fn add_header(&mut self, arena: &mut Arena, name: &str, value: &str) -> Result<&mut Self> {
        self.check_headers()?;
        check_field(name, value)?;
        self.headers.append_str(arena, name, value)?;
        Ok(self)
    }

    /// Removes every header named `name`.
    pub fn remove_header(&mut self, arena: &Arena, name: &str) -> Result<&mut Self> {
        self.check_headers()?;
        self.headers.remove(arena, name);
        Ok(self)
    }

    #[inline]
    pub fn header<'a>(&self, arena: &'a Arena, name: &str) -> Option<&'a str> {
        self.headers.get(arena, name)
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderContainer {
        &self.headers
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close_connection(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub fn headers_written(&self) -> bool {
        self.headers_written
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn check_field(name: &str, value: &str) -> Result<()> {
    match headers::is_token(name) && headers::is_field_value(value) {
        true => Ok(()),
        false => Err(Error::InvalidResponseHeader(name.to_owned())),
    }
}

// Canned responses
impl Response {
    /// `302 Found` to `location`, with an empty body.
    pub fn redirect(&mut self, arena: &mut Arena, location: &str) -> Result<()> {
        self.clear()?;
        self.status(StatusCode::Found)?
            .set_header(arena, "Location", location)?;
        Ok(())
    }

    /// Replaces everything buffered with a minimal HTML page for `status`.
    pub fn error_page(&mut self, status: StatusCode) -> Result<()> {
        self.clear()?;
        self.headers.clear();
        self.status(status)?;

        let (code, reason) = (status.as_u16(), status.reason());
        self.write("<!DOCTYPE html><html><head><title>");
        self.write(code);
        self.write(' ');
        self.write(reason);
        self.write("</title></head><body><h1>");
        self.write(code);
        self.write(' ');
        self.write(reason);
        self.write("</h1></body></html>");
        Ok(())
    }
}

// Serialization
impl Response {
    /// Appends the head to `out`: status line, explicit headers in insertion
    /// order, then the defaults that were not set explicitly (`Connection`,
    /// `Content-Type`) and the empty line.
    ///
    /// `Content-Length` is always the length of the buffered body; an
    /// explicit one is dropped.
    pub fn serialize_headers(&self, arena: &Arena, out: &mut Vec<u8>) {
        match self.reason {
            Reason::Canonical(status) if status.as_u16() == self.status => {
                out.extend_from_slice(status.first_line(self.version));
            }
            _ => {
                out.extend_from_slice(self.version.as_str().as_bytes());
                out.push(b' ');
                self.status.write_to(out);
                out.push(b' ');
                out.extend_from_slice(self.status_text(arena).as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        for (name, value) in self.headers.iter(arena) {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Content-Length: ");
        self.body.len().write_to(out);
        out.extend_from_slice(b"\r\n");
        if !self.headers.contains(arena, "connection") {
            out.extend_from_slice(match self.keep_alive {
                true => b"Connection: keep-alive\r\n",
                false => b"Connection: close\r\n",
            });
        }
        if !self.headers.contains(arena, "content-type") {
            out.extend_from_slice(b"Content-Type: text/html; charset=UTF-8\r\n");
        }

        out.extend_from_slice(b"\r\n");
    }

    /// Sends the response.
    ///
    /// The first call writes `[head, body]` in one vectored write. If the
    /// head was already written, only the body buffered since is sent. The
    /// response is closed once the write completes; further calls are no-ops.
    pub async fn flush<S>(&mut self, stream: &mut S, arena: &Arena, timeout: Duration) -> Result<()>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        if self.closed {
            return Ok(());
        }

        let mut head = mem::take(&mut self.head);
        if !self.headers_written {
            if self
                .headers
                .get(arena, "connection")
                .is_some_and(|value| value.eq_ignore_ascii_case("close"))
            {
                self.keep_alive = false;
            }

            head.clear();
            self.serialize_headers(arena, &mut head);
            self.headers_written = true;
        } else {
            head.clear();
        }

        let body = match self.omit_body {
            true => &[][..],
            false => &self.body[self.sent..],
        };

        let result = tokio::select! {
            biased;

            result = write_all_vectored(stream, &head, body) => result,
            _ = sleep(timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        };

        self.head = head;
        self.sent = self.body.len();
        self.closed = true;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.keep_alive = false;
                Err(e.into())
            }
        }
    }
}

async fn write_all_vectored<S>(stream: &mut S, head: &[u8], body: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let written = stream
        .write_vectored(&[IoSlice::new(head), IoSlice::new(body)])
        .await?;

    if written == 0 && !(head.is_empty() && body.is_empty()) {
        return Err(io::ErrorKind::WriteZero.into());
    }

    let from_head = written.min(head.len());
    stream.write_all(&head[from_head..]).await?;
    stream.write_all(&body[written - from_head..]).await?;
    stream.flush().await
}

pub mod write {
    use super::*;
    use std::{borrow::Cow, fmt, rc::Rc, sync::Arc};

    /// Writer over the response body.
    ///
    /// Handed to [`Page::render`](crate::Page::render). Writes to a closed
    /// response are dropped.
    ///
    /// With [WriteBuffer]:
    /// ```
    /// use pagecycle::{Response, limits::RespLimits};
    ///
    /// let mut resp = Response::new(&RespLimits::default());
    /// let mut w = resp.body_writer();
    /// w.write("Total: ");
    /// w.write(42);
    /// w.write(true);
    /// assert_eq!(resp.body(), b"Total: 42true");
    /// ```
    /// With [std::fmt::Write]:
    /// ```
    /// use pagecycle::{Response, limits::RespLimits};
    /// use std::fmt::Write;
    ///
    /// let mut resp = Response::new(&RespLimits::default());
    /// write!(resp.body_writer(), "{} - {} = {}", 6, 2, 4).unwrap();
    /// assert_eq!(resp.body(), b"6 - 2 = 4");
    /// ```
    #[derive(Debug)]
    pub struct BodyWriter<'a> {
        pub(crate) buffer: &'a mut Vec<u8>,
        pub(crate) closed: bool,
    }

    impl BodyWriter<'_> {
        /// Appends content to the body. Returns `false` if the response is closed.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) -> bool {
            if self.closed {
                return false;
            }
            value.write_to(self.buffer);
            true
        }

        /// Bytes buffered so far.
        #[inline(always)]
        pub fn len(&self) -> usize {
            self.buffer.len()
        }

        #[inline(always)]
        pub fn is_empty(&self) -> bool {
            self.buffer.is_empty()
        }
    }

    impl io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "response already sent",
                ));
            }
            self.buffer.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl fmt::Write for BodyWriter<'_> {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            match self.write(s) {
                true => Ok(()),
                false => Err(fmt::Error),
            }
        }
    }

    /// Values that can be appended to a response body.
    ///
    /// Implemented for strings, bytes, booleans, chars and integers.
    /// Floating-point numbers are left out on purpose: format them with the
    /// precision you need and write the string.
    ///
    /// ```
    /// use pagecycle::WriteBuffer;
    ///
    /// struct Escaped<'a>(&'a str);
    ///
    /// impl WriteBuffer for Escaped<'_> {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         for c in self.0.chars() {
    ///             match c {
    ///                 '<' => buffer.extend_from_slice(b"&lt;"),
    ///                 '>' => buffer.extend_from_slice(b"&gt;"),
    ///                 '&' => buffer.extend_from_slice(b"&amp;"),
    ///                 c => c.write_to(buffer),
    ///             }
    ///         }
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }
    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_unsigned => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    fn write_unsigned(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        let (arr, start) = number_to_bytes(value.unsigned_abs());
        buffer.extend_from_slice(&arr[start..]);
    }

    /// Decimal digits of `n`, right-aligned. Returns the buffer and the
    /// index of the first digit.
    #[inline]
    pub(crate) const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}
