use crate::{
    arena::{Allocator, Arena, PoolStr},
    errors::{Error, Result},
    http::{
        request::{Parser, Request, RequestView},
        response::Response,
    },
    limits::ConnLimits,
    page::{
        completion::Completion,
        driver::{run_page, Page, Stage},
    },
    server::loader::PageLoader,
    BodyWriter, Method,
};
use std::{
    fmt,
    path::{Component, Path},
};
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream a page pipeline runs on.
pub trait Stream: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin + ?Sized> Stream for T {}

/// A page produced by [`PageContext::load_nested_page`], ready to be run
/// with [`PageContext::run_nested`].
pub struct NestedPage {
    pub page: Box<dyn Page>,
    /// Path relative to the server root
    pub path: String,
}

impl fmt::Debug for NestedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedPage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Everything a page stage can touch.
///
/// The context borrows the connection's request, response, arena and stream
/// for the duration of one page run. It also carries the two life-cycle
/// flags:
///
/// - `do_render`: cleared by [`cancel_render`](Self::cancel_render), the
///   `Render` stage is then skipped but the response is still flushed.
/// - `do_read_post`: whether the `ReadingPost` stage runs (default: the
///   method is `POST`).
pub struct PageContext<'a> {
    request: &'a mut Request,
    response: &'a mut Response,
    arena: &'a mut Arena,
    stream: &'a mut dyn Stream,
    parser: &'a mut Parser,
    limits: &'a ConnLimits,
    loader: &'a dyn PageLoader,

    page_path: PoolStr,
    do_render: bool,
    do_read_post: bool,

    pub(crate) stage: Stage,
    pub(crate) pending_cancel: Option<Error>,
    nested: bool,
}

impl<'a> PageContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: &'a mut Request,
        response: &'a mut Response,
        arena: &'a mut Arena,
        stream: &'a mut dyn Stream,
        parser: &'a mut Parser,
        limits: &'a ConnLimits,
        loader: &'a dyn PageLoader,
        page_path: PoolStr,
    ) -> Self {
        let do_read_post = request.method() == Method::Post;

        Self {
            request,
            response,
            arena,
            stream,
            parser,
            limits,
            loader,

            page_path,
            do_render: true,
            do_read_post,

            stage: Stage::Init,
            pending_cancel: None,
            nested: false,
        }
    }
}

// Stage control
impl PageContext<'_> {
    /// Aborts the run. Only allowed during `Init` and `ReadingPost`; the
    /// driver then skips `Load` and `Render`, sends an error response and
    /// finalizes the page.
    ///
    /// If several cancellations are requested, the first one is kept.
    pub fn cancel_load(&mut self, error: Error) -> Result<()> {
        match self.stage {
            Stage::Init | Stage::ReadingPost => {
                if self.pending_cancel.is_none() {
                    self.pending_cancel = Some(error);
                }
                Ok(())
            }
            stage => Err(Error::InvalidStage(stage)),
        }
    }

    /// Skips the `Render` stage. The response is still flushed.
    #[inline]
    pub fn cancel_render(&mut self) {
        self.do_render = false;
    }

    #[inline]
    pub fn set_do_read_post(&mut self, value: bool) {
        self.do_read_post = value;
    }

    #[inline(always)]
    pub fn do_render(&self) -> bool {
        self.do_render
    }

    #[inline(always)]
    pub fn do_read_post(&self) -> bool {
        self.do_read_post
    }

    #[inline(always)]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// `true` for a page run by [`run_nested`](Self::run_nested).
    #[inline(always)]
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

// Request and response access
impl PageContext<'_> {
    #[inline]
    pub fn request(&self) -> RequestView<'_> {
        self.request.view(self.arena)
    }

    #[inline(always)]
    pub fn response(&mut self) -> &mut Response {
        &mut *self.response
    }

    /// Response and arena together, for the response methods that intern.
    #[inline(always)]
    pub fn response_parts(&mut self) -> (&mut Response, &mut Arena) {
        (&mut *self.response, &mut *self.arena)
    }

    /// Replaces a response header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.response.set_header(self.arena, name, value)?;
        Ok(())
    }

    /// Redirects with `302 Found` and skips rendering.
    pub fn redirect(&mut self, location: &str) -> Result<()> {
        self.response.redirect(self.arena, location)?;
        self.do_render = false;
        Ok(())
    }

    /// Path of the running page, relative to the server root.
    #[inline]
    pub fn page_path(&self) -> &str {
        self.arena.get(self.page_path).unwrap_or_default()
    }

    #[inline(always)]
    pub fn limits(&self) -> &ConnLimits {
        self.limits
    }
}

impl Allocator for PageContext<'_> {
    #[inline(always)]
    fn arena(&mut self) -> &mut Arena {
        &mut *self.arena
    }
}

// Driver hooks
impl PageContext<'_> {
    pub(crate) async fn read_post(&mut self) -> Result<()> {
        self.parser
            .read_form(
                &mut *self.stream,
                self.request,
                self.arena,
                self.limits.socket_read_timeout,
            )
            .await
    }

    #[inline]
    pub(crate) fn render_parts(&mut self) -> (RequestView<'_>, BodyWriter<'_>) {
        (self.request.view(self.arena), self.response.body_writer())
    }

    /// Sends the response. Nested pages transmit nothing.
    pub(crate) async fn flush_response(&mut self) -> Result<()> {
        if self.nested {
            return Ok(());
        }

        // Unread bytes must never be parsed as the next request
        if !self.request.body_settled() {
            self.response.close_connection();
        }

        self.response
            .flush(&mut *self.stream, self.arena, self.limits.socket_write_timeout)
            .await
    }

    /// Replaces the buffered output with an error page, if nothing was
    /// sent yet.
    pub(crate) fn prepare_error_response(&mut self, error: &Error) -> bool {
        if self.nested || self.response.headers_written() {
            return false;
        }
        if error.is_client_error() {
            self.response.close_connection();
        }
        self.response.error_page(error.status()).is_ok()
    }
}

// Paths and nested pages
impl PageContext<'_> {
    /// Maps `path`, relative to the current page, to a path relative to the
    /// server root. The result is normalized and never leaves the root.
    ///
    /// ```text
    /// current page: /blog/post.page
    ///
    /// "side.page"        -> /blog/side.page
    /// "../index.page"    -> /index.page
    /// "/about.page"      -> /about.page
    /// "../../../etc"     -> /etc
    /// ```
    pub fn map_relative_path(&mut self, path: &str) -> Result<PoolStr> {
        let mapped = self.relative_to_root(path);
        self.arena.intern(&mapped)
    }

    /// Like [`map_relative_path`](Self::map_relative_path), the result is
    /// stored by `alloc`.
    pub fn map_relative_path_in(&self, path: &str, alloc: &mut dyn Allocator) -> Result<PoolStr> {
        let mapped = self.relative_to_root(path);
        alloc.intern(&mapped)
    }

    /// Maps `path`, relative to the current page, to an absolute path
    /// through the loader.
    pub fn map_path(&mut self, path: &str) -> Result<PoolStr> {
        let mapped = self.loader.map_path(&self.relative_to_root(path));
        self.arena.intern(&mapped)
    }

    /// Like [`map_path`](Self::map_path), the result is stored by `alloc`.
    pub fn map_path_in(&self, path: &str, alloc: &mut dyn Allocator) -> Result<PoolStr> {
        let mapped = self.loader.map_path(&self.relative_to_root(path));
        alloc.intern(&mapped)
    }

    /// Absolute path of the current page.
    pub fn file_path(&mut self) -> Result<PoolStr> {
        let mapped = self.loader.map_path(self.page_path());
        self.arena.intern(&mapped)
    }

    /// Loads the page at `path`, relative to the current page. The loader
    /// allocates in the request arena.
    pub async fn load_nested_page(&mut self, path: &str) -> Result<NestedPage> {
        let path = self.relative_to_root(path);
        let loader = self.loader;

        let page = loader.load_page(&path, self.arena).await?;
        tracing::debug!(path = path.as_str(), "nested page loaded");

        Ok(NestedPage { page, path })
    }

    /// Loads the page at `path`, relative to the current page. The loader
    /// allocates in `arena`, which may outlive the request.
    pub async fn load_nested_page_in(&self, path: &str, arena: &mut Arena) -> Result<NestedPage> {
        let path = self.relative_to_root(path);

        let page = self.loader.load_page(&path, arena).await?;
        tracing::debug!(path = path.as_str(), arena = arena.id(), "nested page loaded");

        Ok(NestedPage { page, path })
    }

    /// Runs the full life-cycle of `nested` against the current request.
    ///
    /// The child renders into this response buffer and shares this arena.
    /// Its `Flush` stage transmits nothing and it has its own completion.
    /// Errors of the child are returned after it was finalized; this page
    /// decides what to do with them.
    pub async fn run_nested(&mut self, nested: &mut NestedPage) -> Result<()> {
        let page_path = self.arena.intern(&nested.path)?;

        let mut child = PageContext {
            request: &mut *self.request,
            response: &mut *self.response,
            arena: &mut *self.arena,
            stream: &mut *self.stream,
            parser: &mut *self.parser,
            limits: self.limits,
            loader: self.loader,

            page_path,
            do_render: true,
            do_read_post: self.do_read_post,

            stage: Stage::Init,
            pending_cancel: None,
            nested: true,
        };

        let path = nested.path.as_str();
        let completion = Completion::new(move || tracing::trace!(path, "nested page completed"));

        run_page(nested.page.as_mut(), &mut child, completion).await
    }

    fn relative_to_root(&self, path: &str) -> String {
        let current = Path::new(self.page_path());
        let base = current.parent().unwrap_or_else(|| Path::new("/"));

        let mut mapped = String::with_capacity(path.len() + 16);
        normalize_path(&base.join(path), &mut mapped);
        mapped
    }
}

/// Writes `path` to `out` as a normalized absolute path. `..` never climbs
/// above the root.
pub(crate) fn normalize_path(path: &Path, out: &mut String) {
    out.clear();

    let cleaned = path_clean::clean(Path::new("/").join(path));
    for component in cleaned.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
}

/// Page path of `request`: its decoded path, normalized into `scratch`.
/// The request's own handle is reused when normalizing changed nothing.
pub(crate) fn page_path(request: &Request, arena: &mut Arena, scratch: &mut String) -> Result<PoolStr> {
    let decoded = request.path();
    normalize_path(Path::new(arena.get(decoded).unwrap_or("/")), scratch);

    match arena.eq_str(decoded, scratch) {
        true => Ok(decoded),
        false => arena.intern(scratch),
    }
}

impl fmt::Debug for PageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageContext")
            .field("page_path", &self.page_path())
            .field("stage", &self.stage)
            .field("do_render", &self.do_render)
            .field("do_read_post", &self.do_read_post)
            .field("nested", &self.nested)
            .finish_non_exhaustive()
    }
}
