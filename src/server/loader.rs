use crate::{arena::Arena, errors::Result, page::driver::Page};
use std::{future::Future, pin::Pin};

/// Future returned by [`PageLoader::load_page`].
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<Box<dyn Page>>> + 'a>>;

/// Source of pages, supplied by the router that owns the document root.
///
/// # Examples
/// ```
/// use pagecycle::{Arena, Error, LoadFuture, Page, PageLoader};
///
/// struct Static;
/// struct Index;
///
/// impl Page for Index {}
///
/// impl PageLoader for Static {
///     fn load_page<'a>(&'a self, path: &'a str, _: &'a mut Arena) -> LoadFuture<'a> {
///         Box::pin(async move {
///             match path {
///                 "/" | "/index.page" => Ok(Box::new(Index) as Box<dyn Page>),
///                 _ => Err(Error::NotFound(path.to_owned())),
///             }
///         })
///     }
///
///     fn map_path(&self, relative: &str) -> String {
///         format!("/var/www{relative}")
///     }
/// }
/// ```
pub trait PageLoader {
    /// Instantiates the page at `path`, relative to the server root.
    ///
    /// Data the page needs for the request only can be allocated in `arena`.
    /// A missing page is [`Error::NotFound`](crate::Error::NotFound), a page
    /// that failed to load is [`Error::PageLoad`](crate::Error::PageLoad).
    fn load_page<'a>(&'a self, path: &'a str, arena: &'a mut Arena) -> LoadFuture<'a>;

    /// Absolute path of `relative`, a path relative to the server root.
    fn map_path(&self, relative: &str) -> String;
}
