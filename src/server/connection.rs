use crate::{
    arena::{Arena, PoolStr},
    errors::{Error, Result},
    http::{
        request::{Parser, Request},
        response::Response,
    },
    limits::{ConnLimits, Limits},
    page::{
        completion::Completion,
        context::{self, PageContext},
        driver::{respond_error, run_page},
    },
    server::loader::PageLoader,
    Method,
};
use crossbeam::queue::ArrayQueue;
use std::{cell::Cell, io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

/// The per-request resources: arena, request and response.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) arena: Arena,
    pub(crate) request: Request,
    pub(crate) response: Response,
}

impl Exchange {
    fn new(limits: &Limits) -> Self {
        Self {
            arena: Arena::new(&limits.arena),
            request: Request::new(&limits.request),
            response: Response::new(&limits.response),
        }
    }

    /// Invalidates every handle of the last request and clears the buffers.
    #[inline]
    fn recycle(&mut self, limits: &Limits) {
        self.request.reset();
        self.response.reset(&limits.response);
        self.arena.recycle(&limits.arena);
    }
}

/// Pool of idle exchanges shared by all connections.
///
/// Backed by a bounded lock-free queue: returning an exchange to a full pool
/// drops it.
///
/// ```
/// use pagecycle::{ExchangePool, limits::{Limits, PoolLimits}};
///
/// let pool = ExchangePool::new(Limits {
///     pool: PoolLimits { max_idle: 8, ..PoolLimits::default() },
///     ..Limits::default()
/// });
/// assert_eq!(pool.idle(), 0);
/// ```
#[derive(Debug)]
pub struct ExchangePool {
    queue: ArrayQueue<Exchange>,
    limits: Limits,
}

impl ExchangePool {
    pub fn new(limits: Limits) -> Self {
        Self {
            queue: ArrayQueue::new(limits.pool.max_idle.max(1)),
            limits,
        }
    }

    #[inline]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Idle exchanges ready for reuse.
    #[inline]
    pub fn idle(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn acquire(&self) -> Exchange {
        self.queue
            .pop()
            .unwrap_or_else(|| Exchange::new(&self.limits))
    }

    pub(crate) fn release(&self, mut exchange: Exchange) {
        exchange.recycle(&self.limits);

        if self.queue.push(exchange).is_err() {
            tracing::debug!(max_idle = self.queue.capacity(), "exchange pool full, dropping");
        }
    }
}

/// Serves the requests of one connection.
///
/// The read buffer is allocated once and kept across connections, so a
/// worker should reuse one `HttpConnection` for every stream it handles.
/// Page futures are not `Send`: run connections on a
/// [`LocalSet`](tokio::task::LocalSet) or a current-thread runtime.
pub struct HttpConnection<L: PageLoader> {
    loader: Arc<L>,
    pool: Arc<ExchangePool>,
    parser: Parser,
    /// Path of the current request, handed to the loader
    path: String,
}

impl<L: PageLoader> HttpConnection<L> {
    pub fn new(loader: Arc<L>, pool: Arc<ExchangePool>) -> Self {
        let parser = Parser::new(&pool.limits().request);

        Self {
            loader,
            pool,
            parser,
            path: String::with_capacity(128),
        }
    }

    /// Serves requests until the peer closes, keep-alive ends or a request
    /// fails. Returns the number of requests read.
    ///
    /// Malformed requests get a canned `4xx` response before the connection
    /// closes. Transport errors are returned, nothing is sent.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.parser.reset();

        let pool = Arc::clone(&self.pool);
        let mut exchange = pool.acquire();
        let result = self.serve(stream, &mut exchange, pool.limits()).await;
        pool.release(exchange);

        match &result {
            Ok(served) => tracing::debug!(served, "connection closed"),
            Err(e) => tracing::debug!(error = %e, "connection failed"),
        }
        result
    }

    async fn serve<S>(&mut self, stream: &mut S, ex: &mut Exchange, limits: &Limits) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn = &limits.connection;
        let mut served = 0;

        while served < conn.max_requests_per_connection {
            if !self.parser.read_head(stream, conn.socket_read_timeout).await? {
                break;
            }
            served += 1;

            if let Err(e) = self.parser.parse_head(&mut ex.request, &mut ex.arena) {
                reject(stream, ex, e, conn).await?;
                break;
            }

            ex.response.version = ex.request.version();
            ex.response.keep_alive =
                ex.request.keep_alive && served < conn.max_requests_per_connection;
            ex.response.omit_body = ex.request.method() == Method::Head;

            let (page_path, loaded) =
                match context::page_path(&ex.request, &mut ex.arena, &mut self.path) {
                    Ok(page_path) => (
                        page_path,
                        self.loader.load_page(&self.path, &mut ex.arena).await,
                    ),
                    Err(e) => (PoolStr::EMPTY, Err(e)),
                };

            let completed = Cell::new(false);
            let outcome = {
                let mut ctx = PageContext::new(
                    &mut ex.request,
                    &mut ex.response,
                    &mut ex.arena,
                    &mut *stream,
                    &mut self.parser,
                    conn,
                    &*self.loader,
                    page_path,
                );

                match loaded {
                    Ok(mut page) => {
                        let completion = Completion::new(|| completed.set(true));
                        run_page(page.as_mut(), &mut ctx, completion).await
                    }
                    Err(e) => respond_error(&mut ctx, &e).await,
                }
            };

            match outcome {
                Err(e) if e.is_transport() => return Err(e),
                // Already answered with an error page
                _ => {}
            }

            let keep_alive = ex.response.is_keep_alive() && ex.response.is_closed();
            self.parser.finish(&ex.request);

            tracing::debug!(
                path = self.path.as_str(),
                status = ex.response.status_code(),
                page_completed = completed.get(),
                keep_alive,
                pipelined = self.parser.has_buffered(),
                "request served"
            );
            ex.recycle(limits);

            if !keep_alive {
                break;
            }
        }

        Ok(served)
    }
}

/// Answers a request whose head could not be parsed. The connection is
/// closed afterwards.
async fn reject<S>(stream: &mut S, ex: &mut Exchange, error: Error, conn: &ConnLimits) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    match error {
        Error::MalformedRequest(kind) => {
            tracing::warn!(reason = %kind, "malformed request");
            write_bytes(
                stream,
                kind.as_http(ex.request.version()),
                conn.socket_write_timeout,
            )
            .await
        }
        error if error.is_transport() => Err(error),
        error => {
            tracing::warn!(error = %error, "request rejected");
            ex.response.close_connection();
            ex.response.error_page(error.status())?;
            ex.response
                .flush(stream, &ex.arena, conn.socket_write_timeout)
                .await
        }
    }
}

async fn write_bytes<S>(stream: &mut S, bytes: &[u8], time: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout(time, async {
        stream.write_all(bytes).await?;
        stream.flush().await
    })
    .await
    .map_err(io::Error::from)??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        limits::{ArenaLimits, PoolLimits},
        server::loader::LoadFuture,
        tools::*,
        BodyWriter, Malformed, Page, PageContext, RequestView, StageFuture, Version,
    };

    struct Hello;

    impl Page for Hello {
        fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
            out.write("Hello, ");
            out.write(req.query("name").unwrap_or("world"));
            Ok(())
        }
    }

    struct Form;

    impl Page for Form {
        fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
            for (key, value) in req.form_fields() {
                out.write(key);
                out.write('=');
                out.write(value);
                out.write(';');
            }
            Ok(())
        }
    }

    struct Hungry;

    impl Page for Hungry {
        fn init<'a>(&'a mut self, ctx: &'a mut PageContext<'_>) -> StageFuture<'a> {
            Box::pin(async move {
                let big = "x".repeat(4096);
                ctx.map_relative_path(&big)?;
                Ok(())
            })
        }
    }

    struct Site;

    impl PageLoader for Site {
        fn load_page<'a>(&'a self, path: &'a str, _: &'a mut Arena) -> LoadFuture<'a> {
            Box::pin(async move {
                let page: Box<dyn Page> = match path {
                    "/hello" => Box::new(Hello),
                    "/form" => Box::new(Form),
                    "/hungry" => Box::new(Hungry),
                    _ => return Err(Error::NotFound(path.to_owned())),
                };
                Ok(page)
            })
        }

        fn map_path(&self, relative: &str) -> String {
            format!("/srv{relative}")
        }
    }

    fn connection(limits: Limits) -> HttpConnection<Site> {
        HttpConnection::new(Arc::new(Site), Arc::new(ExchangePool::new(limits)))
    }

    async fn serve(raw: &str) -> (Result<usize>, String) {
        serve_with(Limits::default(), raw).await
    }

    async fn serve_with(limits: Limits, raw: &str) -> (Result<usize>, String) {
        let mut stream = MockStream::new(raw).chunked(11);
        let result = connection(limits).run(&mut stream).await;
        (result, stream.output_str().to_owned())
    }

    #[tokio::test]
    async fn pipelined_keep_alive() {
        let (result, out) = serve(
            "GET /hello?name=Ann HTTP/1.1\r\n\r\n\
             GET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(out.matches("Connection: keep-alive\r\n").count(), 2);
        assert!(out.contains("\r\n\r\nHello, Ann"));
        assert!(out.ends_with("\r\n\r\nHello, world"));
    }

    #[tokio::test]
    async fn dot_segments_resolve_before_loading() {
        let (result, out) = serve(
            "GET /docs/../hello HTTP/1.1\r\n\r\n\
             GET /..%2F..%2Fhello?name=Bo HTTP/1.1\r\n\r\n\
             GET /../../etc/passwd HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(out.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(out.contains("\r\n\r\nHello, world"));
        assert!(out.contains("\r\n\r\nHello, Bo"));
        assert!(out.contains("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn keep_alive_ends() {
        #[rustfmt::skip]
        let cases = [
            ("GET /hello HTTP/1.0\r\n\r\nGET /hello HTTP/1.0\r\n\r\n",                      1),
            ("GET /hello HTTP/1.1\r\nConnection: close\r\n\r\nGET /hello HTTP/1.1\r\n\r\n", 1),
            ("GET /hello HTTP/1.0\r\nConnection: keep-alive\r\n\r\nGET /hello HTTP/1.0\r\n\r\n", 2),
        ];

        for (raw, expected) in cases {
            let (result, out) = serve(raw).await;

            assert_eq!(result.unwrap(), expected, "{raw}");
            assert!(out.ends_with("Hello, world"), "{raw}");
            assert!(out.contains("Connection: close\r\n"), "{raw}");
        }
    }

    #[tokio::test]
    async fn request_cap_per_connection() {
        let limits = Limits {
            connection: ConnLimits {
                max_requests_per_connection: 2,
                ..ConnLimits::default()
            },
            ..Limits::default()
        };
        let raw = "GET /hello HTTP/1.1\r\n\r\n".repeat(3);

        let (result, out) = serve_with(limits, &raw).await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(out.matches("Connection: keep-alive\r\n").count(), 1);
        assert_eq!(out.matches("Connection: close\r\n").count(), 1);
    }

    #[tokio::test]
    async fn malformed_requests_get_canned_responses() {
        #[rustfmt::skip]
        let cases = [
            ("BREW /pot HTTP/1.1\r\n\r\n",                     Malformed::InvalidMethod),
            ("GET /hello HTTP/2.0\r\n\r\n",                    Malformed::UnsupportedVersion),
            ("GET /hello HTTP/1.1\r\nContent-Length: x\r\n\r\n", Malformed::InvalidContentLength),
        ];

        for (raw, kind) in cases {
            // The second request is never read
            let (result, out) = serve(&format!("{raw}GET /hello HTTP/1.1\r\n\r\n")).await;

            assert_eq!(result.unwrap(), 1, "{raw}");
            assert_eq!(out.as_bytes(), kind.as_http(Version::Http11), "{raw}");
        }
    }

    #[tokio::test]
    async fn missing_page_keeps_connection() {
        let (result, out) = serve(
            "GET /nope HTTP/1.1\r\n\r\n\
             GET /hello HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with("Hello, world"));
    }

    #[tokio::test]
    async fn form_post_then_next_request() {
        let (result, out) = serve(
            "POST /form HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 13\r\n\r\n\
             a=1&b=x+y&a=2\
             GET /hello HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert!(out.contains("\r\n\r\na=1;b=x y;HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn unread_body_closes_connection() {
        let (result, out) = serve(
            "POST /form HTTP/1.1\r\n\
             Content-Type: application/json\r\n\
             Content-Length: 2\r\n\r\n{}\
             GET /hello HTTP/1.1\r\n\r\n",
        )
        .await;

        assert_eq!(result.unwrap(), 1);
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("Hello"));
    }

    #[tokio::test]
    async fn head_request_has_no_body() {
        let (result, out) = serve("HEAD /hello HTTP/1.1\r\n\r\n").await;

        assert_eq!(result.unwrap(), 1);
        assert!(out.contains("Content-Length: 12\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn arena_exhaustion_is_a_server_error() {
        let limits = Limits {
            arena: ArenaLimits {
                initial_size: 512,
                max_size: 2048,
                ..ArenaLimits::default()
            },
            ..Limits::default()
        };

        let (result, out) =
            serve_with(limits, "GET /hungry HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n").await;

        assert_eq!(result.unwrap(), 2);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.ends_with("Hello, world"));
    }

    #[tokio::test]
    async fn transport_errors_are_returned() {
        let mut stream = MockStream::new("GET /hello HTTP/1.1\r\n\r\n").failing_writes();
        let result = connection(Limits::default()).run(&mut stream).await;
        assert!(matches!(result, Err(Error::Transport(_))));

        let mut stream = MockStream::new("GET /hello HTTP/1.1\r\nHost");
        let result = connection(Limits::default()).run(&mut stream).await;
        assert!(matches!(result, Err(Error::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn exchanges_are_recycled() {
        let pool = Arc::new(ExchangePool::new(Limits {
            pool: PoolLimits {
                max_idle: 1,
                ..PoolLimits::default()
            },
            ..Limits::default()
        }));
        let mut conn = HttpConnection::new(Arc::new(Site), Arc::clone(&pool));

        for _ in 0..3 {
            let mut stream = MockStream::new("GET /hello?name=Bo HTTP/1.1\r\n\r\n");
            assert_eq!(conn.run(&mut stream).await.unwrap(), 1);
            assert!(stream.output_str().ends_with("Hello, Bo"));
            assert_eq!(pool.idle(), 1);
        }

        let exchange = pool.acquire();
        assert_eq!(exchange.arena.used(), 0);
        assert!(exchange.request.headers().is_empty());
        assert!(exchange.response.body().is_empty());
    }

}
