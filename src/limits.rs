//! Pipeline limits, timeouts and pool sizes
//!
//! Every structure here is a plain value with documented defaults. Limits are
//! checked at the boundary that owns them:
//!
//! - [`ReqLimits`]: the stream layer (request head buffer) and the body reader
//! - [`RespLimits`]: response buffer recycling
//! - [`ConnLimits`]: socket timeouts and keep-alive
//! - [`ArenaLimits`]: per-request arena growth
//! - [`PoolLimits`]: how many idle exchanges are kept for reuse
//!
//! # Examples
//!
//! ```
//! use pagecycle::limits::{ArenaLimits, ConnLimits, Limits, ReqLimits};
//! use std::time::Duration;
//!
//! let limits = Limits {
//!     request: ReqLimits {
//!         body_size: 256 * 1024, // larger forms
//!         ..ReqLimits::default()
//!     },
//!     connection: ConnLimits {
//!         socket_read_timeout: Duration::from_secs(5),
//!         ..ConnLimits::default()
//!     },
//!     arena: ArenaLimits {
//!         max_size: 4 * 1024 * 1024,
//!         ..ArenaLimits::default()
//!     },
//!     ..Limits::default()
//! };
//! # let _ = limits;
//! ```

use std::time::Duration;

/// All limits of one connection pipeline.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub request: ReqLimits,
    pub response: RespLimits,
    pub connection: ConnLimits,
    pub arena: ArenaLimits,
    pub pool: PoolLimits,
}

/// Request size caps.
///
/// The head cap belongs to the stream layer: a request whose head (request
/// line plus headers) does not fit in `head_size` bytes, or that carries more
/// than `header_count` header lines, fails with a transport error before any
/// header is parsed.
///
/// # Memory
///
/// Each connection pre-allocates one read buffer of `head_size + body_size`
/// bytes, the same strategy as a fixed per-connection parser buffer:
///
/// | Component | Default |
/// |-----------|---------|
/// | Head      | 8 KiB   |
/// | Body      | 64 KiB  |
/// | **Total** | **72 KiB** |
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the request line plus headers, final CRLF included (default: `8 KiB`)
    pub head_size: usize,
    /// Maximum number of header lines (default: `64`)
    pub header_count: usize,
    /// Maximum `Content-Length` accepted for a form body (default: `64 KiB`)
    ///
    /// Larger declared bodies are rejected with `413 Payload Too Large`.
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            head_size: 8 * 1024,
            header_count: 64,
            body_size: 64 * 1024,

            _priv: (),
        }
    }
}

impl ReqLimits {
    /// Size of the per-connection read buffer.
    #[inline(always)]
    pub const fn buffer_size(&self) -> usize {
        self.head_size + self.body_size
    }
}

/// Response buffer management.
///
/// ```rust
/// # use pagecycle::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// // On recycling:
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial body buffer capacity (default: `4 KiB`)
    pub default_capacity: usize,
    /// Capacity above which a recycled buffer is re-allocated (default: `64 KiB`)
    pub max_capacity: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 4 * 1024,
            max_capacity: 64 * 1024,

            _priv: (),
        }
    }
}

/// Connection-level timeouts and keep-alive policy.
///
/// The core never cancels a running stage. Timeouts only apply to socket
/// reads and writes; when one fires, the request fails with a
/// [`Transport`](crate::Error::Transport) error of kind `TimedOut`.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum wait for request bytes (default: `10 seconds`)
    pub socket_read_timeout: Duration,
    /// Maximum duration of one response write (default: `10 seconds`)
    pub socket_write_timeout: Duration,
    /// Requests served before a keep-alive connection is closed (default: `100`)
    pub max_requests_per_connection: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(10),
            socket_write_timeout: Duration::from_secs(10),
            max_requests_per_connection: 100,

            _priv: (),
        }
    }
}

/// Per-request arena sizing.
#[derive(Debug, Clone)]
pub struct ArenaLimits {
    /// Bytes reserved when the arena is created (default: `16 KiB`)
    pub initial_size: usize,
    /// Hard cap; allocations beyond it fail with `OutOfMemory` (default: `1 MiB`)
    pub max_size: usize,
    /// A recycled arena that grew past this is re-created (default: `256 KiB`)
    pub shrink_threshold: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ArenaLimits {
    fn default() -> Self {
        Self {
            initial_size: 16 * 1024,
            max_size: 1024 * 1024,
            shrink_threshold: 256 * 1024,

            _priv: (),
        }
    }
}

/// Exchange pool sizing.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Idle exchanges kept for reuse; extra ones are dropped (default: `64`)
    pub max_idle: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_idle: 64,
            _priv: (),
        }
    }
}
