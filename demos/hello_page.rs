//! Minimal page server.
//!
//! ```text
//! cargo run --example hello_page
//! curl 'http://127.0.0.1:8080/?name=Ada'
//! curl -d 'message=hi+there' http://127.0.0.1:8080/guestbook.page
//! ```
//!
//! `RUST_LOG=pagecycle=debug` shows the life-cycle of every page.

use pagecycle::{
    limits::{ConnLimits, Limits},
    Arena, BodyWriter, Error, ExchangePool, HttpConnection, LoadFuture, NestedPage, Page,
    PageContext, PageLoader, RequestView, Result, StageFuture,
};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::LocalSet};
use tracing_subscriber::EnvFilter;

/// Shared header, rendered inside every page.
struct Banner;

impl Page for Banner {
    fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
        out.write("<header><a href=\"/\">home</a> ");
        out.write(req.path());
        out.write("</header>");
        Ok(())
    }
}

struct Home {
    banner: Option<NestedPage>,
}

impl Page for Home {
    fn init<'a>(&'a mut self, ctx: &'a mut PageContext<'_>) -> StageFuture<'a> {
        Box::pin(async move {
            let mut banner = ctx.load_nested_page("parts/banner.page").await?;
            ctx.run_nested(&mut banner).await?;
            self.banner = Some(banner);
            Ok(())
        })
    }

    fn render(&mut self, req: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
        out.write("<h1>Hello, ");
        out.write(req.query("name").unwrap_or("world"));
        out.write("!</h1>");
        Ok(())
    }
}

#[derive(Default)]
struct Guestbook {
    entries: Vec<String>,
}

impl Page for Guestbook {
    fn load(&mut self, ctx: &mut PageContext<'_>) -> Result<()> {
        let request = ctx.request();
        if let Some(message) = request.form("message") {
            self.entries.push(message.to_owned());
        }
        if request.query("back").is_some() {
            ctx.redirect("/")?;
        }
        Ok(())
    }

    fn render(&mut self, _: RequestView<'_>, out: &mut BodyWriter<'_>) -> Result<()> {
        out.write("<ul>");
        for entry in &self.entries {
            out.write("<li>");
            out.write(entry);
            out.write("</li>");
        }
        out.write("</ul>");
        Ok(())
    }

    fn on_error(&mut self, _: &mut PageContext<'_>, error: &Error) {
        tracing::warn!(%error, "guestbook failed");
    }
}

struct Site;

impl PageLoader for Site {
    fn load_page<'a>(&'a self, path: &'a str, _: &'a mut Arena) -> LoadFuture<'a> {
        Box::pin(async move {
            let page: Box<dyn Page> = match path {
                "/" | "/index.page" => Box::new(Home { banner: None }),
                "/parts/banner.page" => Box::new(Banner),
                "/guestbook.page" => Box::<Guestbook>::default(),
                _ => return Err(Error::NotFound(path.to_owned())),
            };
            Ok(page)
        })
    }

    fn map_path(&self, relative: &str) -> String {
        format!("./www{relative}")
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let limits = Limits {
        connection: ConnLimits {
            socket_read_timeout: Duration::from_secs(5),
            max_requests_per_connection: 100,
            ..ConnLimits::default()
        },
        ..Limits::default()
    };

    let listener = TcpListener::bind("127.0.0.1:8080").await?;
    let loader = Arc::new(Site);
    let pool = Arc::new(ExchangePool::new(limits));
    tracing::info!("listening on http://127.0.0.1:8080");

    LocalSet::new()
        .run_until(async move {
            loop {
                let (mut stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        continue;
                    }
                };
                let mut conn = HttpConnection::new(Arc::clone(&loader), Arc::clone(&pool));

                tokio::task::spawn_local(async move {
                    match conn.run(&mut stream).await {
                        Ok(served) => tracing::debug!(%peer, served, "connection closed"),
                        Err(error) => tracing::debug!(%peer, %error, "connection dropped"),
                    }
                });
            }
        })
        .await;
    Ok(())
}
