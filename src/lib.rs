//! pagecycle - Request-processing core of a page-rendering HTTP server
//!
//! A per-connection pipeline that parses HTTP/1.x requests, drives an
//! asynchronous page life-cycle and recycles every per-request resource.
//! Designed for servers that render pages from many small, short-lived
//! requests and want predictable memory per connection.
//!
//! # Pipeline
//!
//! ```text
//! bytes -> Parser -> Request (+ Arena) -> PageLoader -> Page life-cycle -> Response -> one vectored write
//!                                                                                     |
//!                                                    Arena reset, exchange back to the pool
//! ```
//!
//! - **Arena-backed requests** - headers, path, query and form strings are
//!   decoded straight into a per-request [`Arena`] and handed out as
//!   generation-checked [`PoolStr`] handles
//! - **Fixed life-cycle** - `Init -> [ReadingPost] -> Load -> [Render] -> Flush -> Finalize`,
//!   sequenced by one driver; pages only fill in the [`Page`] extension points
//! - **Exactly-once completion** - every page run ends by consuming its
//!   [`Completion`], on every error path too
//! - **Single write per response** - head and body leave in one vectored write
//! - **Bounded resources** - request size, arena size, socket timeouts and
//!   pool size are all [`limits`]
//!
//! # Examples
//!
//! ```no_run
//! use pagecycle::{
//!     Arena, BodyWriter, Error, ExchangePool, HttpConnection, LoadFuture, Page, PageLoader,
//!     RequestView, Result, limits::Limits,
//! };
//! use std::sync::Arc;
//! use tokio::{net::TcpListener, task::LocalSet};
//!
//! struct Hello;
//!
//! impl Page for Hello {
//!     fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
//!         out.write("<h1>Hello, ");
//!         out.write(req.query("name").unwrap_or("world"));
//!         out.write("!</h1>");
//!         Ok(())
//!     }
//! }
//!
//! struct Site;
//!
//! impl PageLoader for Site {
//!     fn load_page<'a>(&'a self, path: &'a str, _: &'a mut Arena) -> LoadFuture<'a> {
//!         Box::pin(async move {
//!             match path {
//!                 "/" => Ok(Box::new(Hello) as Box<dyn Page>),
//!                 _ => Err(Error::NotFound(path.to_owned())),
//!             }
//!         })
//!     }
//!
//!     fn map_path(&self, relative: &str) -> String {
//!         format!("/var/www{relative}")
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::io::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let loader = Arc::new(Site);
//!     let pool = Arc::new(ExchangePool::new(Limits::default()));
//!
//!     LocalSet::new()
//!         .run_until(async move {
//!             loop {
//!                 let Ok((mut stream, _)) = listener.accept().await else {
//!                     continue;
//!                 };
//!                 let mut conn = HttpConnection::new(Arc::clone(&loader), Arc::clone(&pool));
//!
//!                 tokio::task::spawn_local(async move {
//!                     let _ = conn.run(&mut stream).await;
//!                 });
//!             }
//!         })
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod arena;
pub(crate) mod http {
    pub mod headers;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod page {
    pub(crate) mod completion;
    pub(crate) mod context;
    pub(crate) mod driver;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod loader;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    arena::{Allocator, Arena, PoolStr, Slot},
    errors::{BoxError, Error, Malformed, Result},
    http::{
        headers::HeaderContainer,
        query,
        request::{Request, RequestView},
        response::{
            write::{BodyWriter, WriteBuffer},
            Response,
        },
        types::{Method, StatusCode, Version},
    },
    page::{
        completion::Completion,
        context::{NestedPage, PageContext, Stream},
        driver::{run_page, Page, Stage, StageFuture},
    },
    server::{
        connection::{ExchangePool, HttpConnection},
        loader::{LoadFuture, PageLoader},
    },
};
