//! Page life-cycle: extension points and the driver that sequences them.
//!
//! ```text
//! Init -> [ReadingPost] -> Load -> [Render] -> Flush -> Finalize -> Done
//! ```
//!
//! - `ReadingPost` runs when [`PageContext::do_read_post`] is set
//! - `Render` is skipped after [`PageContext::cancel_render`]
//!
//! Any error before `Flush` (an `Err` from a stage, or
//! [`PageContext::cancel_load`]) takes the error path: [`Page::on_error`] runs,
//! an error page replaces the buffered output unless headers were already
//! written, and the page is flushed and finalized. A transport failure goes
//! straight to `Finalize`. The completion token fires in every case.

use crate::{
    errors::{Error, Result},
    http::request::RequestView,
    page::{completion::Completion, context::PageContext},
    BodyWriter,
};
use std::{future::Future, pin::Pin};
use tracing::Instrument;

/// Future returned by [`Page::init`].
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Position of a page in its life-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    ReadingPost,
    Load,
    Render,
    Flush,
    Finalize,
    Done,
}

/// A page: the extension points of the life-cycle.
///
/// Every method has a default body, so a page only overrides what it needs.
/// The driver calls them in order; a page never decides what comes next,
/// beyond returning an error or calling the context's cancel methods.
///
/// # Examples
/// ```
/// use pagecycle::{BodyWriter, Page, PageContext, RequestView, Result, StageFuture};
///
/// struct Hello {
///     visits: usize,
/// }
///
/// impl Page for Hello {
///     fn init<'a>(&'a mut self, ctx: &'a mut PageContext<'_>) -> StageFuture<'a> {
///         Box::pin(async move {
///             // Asynchronous setup goes here: nested pages, lookups...
///             self.visits = ctx.request().query("visits").map_or(0, |v| v.len());
///             Ok(())
///         })
///     }
///
///     fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
///         out.write("<p>Hello from ");
///         out.write(req.path());
///         out.write("</p>");
///         Ok(())
///     }
/// }
/// ```
pub trait Page {
    /// First stage and the only asynchronous one. Resolving to `Err` (or
    /// calling [`PageContext::cancel_load`]) aborts the load.
    fn init<'a>(&'a mut self, ctx: &'a mut PageContext<'_>) -> StageFuture<'a> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Runs after the request body was read, before anything is rendered.
    fn load(&mut self, ctx: &mut PageContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Writes the page into the response body.
    fn render(&mut self, request: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
        let _ = (request, out);
        Ok(())
    }

    /// Called once the response was transmitted.
    fn flush_done(&mut self, ctx: &mut PageContext<'_>) {
        let _ = ctx;
    }

    /// Last stage, runs on every path.
    fn finalize(&mut self, ctx: &mut PageContext<'_>) {
        let _ = ctx;
    }

    /// Called on the error path, before the error response is prepared.
    fn on_error(&mut self, ctx: &mut PageContext<'_>, error: &Error) {
        let _ = (ctx, error);
    }
}

/// Runs the life-cycle of `page`, then consumes `completion`.
///
/// Returns the error that diverted the page from the normal path, if any.
/// By then it was already handled: the error response was sent and the
/// page finalized.
pub async fn run_page(
    page: &mut dyn Page,
    ctx: &mut PageContext<'_>,
    completion: Completion<'_>,
) -> Result<()> {
    let span = tracing::debug_span!(
        "page",
        path = ctx.page_path(),
        method = %ctx.request().method(),
        nested = ctx.is_nested(),
    );

    async move {
        let outcome = match prepare(page, ctx).await {
            Ok(()) => flush(page, ctx).await,
            Err(e) if e.is_transport() => {
                tracing::error!(error = %e, "transport failure, finalizing");
                ctx.response().close_connection();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(stage = ?ctx.stage, error = %e, "page load cancelled");
                page.on_error(ctx, &e);

                if ctx.prepare_error_response(&e) {
                    enter(ctx, Stage::Flush);
                    if let Err(flush_error) = ctx.flush_response().await {
                        tracing::error!(error = %flush_error, "failed to send the error response");
                    }
                }
                Err(e)
            }
        };

        enter(ctx, Stage::Finalize);
        page.finalize(ctx);

        enter(ctx, Stage::Done);
        completion.complete();

        outcome
    }
    .instrument(span)
    .await
}

/// `Init` to `Render`.
async fn prepare(page: &mut dyn Page, ctx: &mut PageContext<'_>) -> Result<()> {
    enter(ctx, Stage::Init);
    let init = page.init(ctx).await;
    take_cancel(ctx)?;
    init?;

    if ctx.do_read_post() {
        enter(ctx, Stage::ReadingPost);
        ctx.read_post().await?;
        take_cancel(ctx)?;
    }

    enter(ctx, Stage::Load);
    page.load(ctx)?;

    if ctx.do_render() {
        enter(ctx, Stage::Render);
        let (view, mut out) = ctx.render_parts();
        page.render(view, &mut out)?;
    } else {
        tracing::trace!("render skipped");
    }

    Ok(())
}

async fn flush(page: &mut dyn Page, ctx: &mut PageContext<'_>) -> Result<()> {
    enter(ctx, Stage::Flush);

    match ctx.flush_response().await {
        Ok(()) => {
            page.flush_done(ctx);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to send the response");
            Err(e)
        }
    }
}

#[inline]
fn take_cancel(ctx: &mut PageContext<'_>) -> Result<()> {
    match ctx.pending_cancel.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[inline]
fn enter(ctx: &mut PageContext<'_>, stage: Stage) {
    tracing::trace!(from = ?ctx.stage, to = ?stage, "stage");
    ctx.stage = stage;
}

/// Answers with the error page for `error`, without running a page.
/// Used when no page could be loaded.
pub(crate) async fn respond_error(ctx: &mut PageContext<'_>, error: &Error) -> Result<()> {
    tracing::warn!(error = %error, "no page for request");

    if ctx.prepare_error_response(error) {
        ctx.stage = Stage::Flush;
        ctx.flush_response().await?;
    }
    ctx.stage = Stage::Done;
    Ok(())
}
