//! `application/x-www-form-urlencoded` codec over arena storage.
//!
//! Used for both the query string of the request target and form bodies.
//! Keys and values are URL-decoded straight into the request [`Arena`]: the
//! decoder writes into a fresh allocation sized for the encoded input and
//! gives the unused tail back, so no intermediate buffer is needed.
//!
//! # Format
//!
//! - pairs are separated by `&`, empty segments (`a=1&&b=2`) are skipped
//! - each pair is split on the **first** `=`; a pair without `=` has an empty value
//! - `%XX` decodes to the byte `0xXX` and `+` to a space; a `%` that is not
//!   followed by two hex digits is kept literally
//! - duplicate keys: **the first occurrence wins** in a [`StringMap`]
//!
//! ```
//! use pagecycle::{Arena, query::{Query, StringMap}};
//!
//! let mut arena = Arena::with_capacity(256, 1024);
//! let mut map = StringMap::default();
//! Query::parse_into(&mut map, b"?name=J%C3%BCrgen&tag=a&tag=b&flag", &mut arena).unwrap();
//!
//! assert_eq!(map.get(&arena, "name"), Some("Jürgen"));
//! assert_eq!(map.get(&arena, "tag"), Some("a"));
//! assert_eq!(map.get(&arena, "flag"), Some(""));
//! ```

use crate::{
    arena::{Arena, PoolStr},
    errors::{Error, Result},
};
use memchr::{memchr, memchr2};

/// Query string and form body parser.
pub struct Query;

impl Query {
    /// Parses `query` into a new collection.
    #[inline(always)]
    pub fn parse<C: QueryCollector + Default>(query: &[u8], arena: &mut Arena) -> Result<C> {
        let mut result = C::default();
        Self::parse_into(&mut result, query, arena)?;
        Ok(result)
    }

    /// Parses `query` into an existing collection. An optional leading `?` is
    /// ignored, so `?a=1` and `a=1` are equivalent.
    ///
    /// Fails with `OutOfMemory` if the arena is exhausted, or
    /// `InvalidEncoding` if a decoded key or value is not UTF-8.
    pub fn parse_into<C: QueryCollector>(
        result: &mut C,
        query: &[u8],
        arena: &mut Arena,
    ) -> Result<()> {
        let data = match query.first() {
            Some(b'?') => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            let segment = &data[start..end];
            start = end + 1;

            if segment.is_empty() {
                continue;
            }

            let (key, value) = match memchr(b'=', segment) {
                Some(index) => (&segment[..index], &segment[index + 1..]),
                None => (segment, &b""[..]),
            };

            let key = intern_decoded(arena, key, Component::Form)?;
            let value = intern_decoded(arena, value, Component::Form)?;
            result.add_param(arena, key, value);
        }

        Ok(())
    }
}

/// Destination of parsed parameters.
///
/// [`StringMap`] keeps the first value of each key; `Vec<(PoolStr, PoolStr)>`
/// keeps every pair in order.
pub trait QueryCollector {
    /// Adds one decoded pair. `arena` resolves handles for content comparison.
    fn add_param(&mut self, arena: &Arena, key: PoolStr, value: PoolStr);
}

impl QueryCollector for Vec<(PoolStr, PoolStr)> {
    #[inline(always)]
    fn add_param(&mut self, _: &Arena, key: PoolStr, value: PoolStr) {
        self.push((key, value));
    }
}

impl QueryCollector for StringMap {
    #[inline(always)]
    fn add_param(&mut self, arena: &Arena, key: PoolStr, value: PoolStr) {
        self.insert(arena, key, value);
    }
}

// STRING MAP

/// Ordered string-to-string mapping over arena handles.
///
/// Lookups compare contents, never handles. Inserting a key that is already
/// present is ignored, so the first value wins.
#[derive(Debug, Clone, Default)]
pub struct StringMap {
    entries: Vec<(PoolStr, PoolStr)>,
}

impl StringMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts `key` unless a key with the same content exists.
    /// Returns `true` if the pair was stored.
    pub fn insert(&mut self, arena: &Arena, key: PoolStr, value: PoolStr) -> bool {
        let Some(name) = arena.get(key) else {
            return false;
        };
        if self.contains_key(arena, name) {
            return false;
        }

        self.entries.push((key, value));
        true
    }

    /// Value stored for `key`, case-sensitive.
    pub fn get<'a>(&self, arena: &'a Arena, key: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| arena.eq_str(*k, key))
            .and_then(|(_, v)| arena.get(*v))
    }

    #[inline]
    pub fn contains_key(&self, arena: &Arena, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| arena.eq_str(*k, key))
    }

    /// Pairs in insertion order. Stale handles are skipped.
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .iter()
            .filter_map(|(k, v)| Some((arena.get(*k)?, arena.get(*v)?)))
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// DECODING

#[inline(always)]
const fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// What is being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Component {
    /// Request path: `+` is literal and `%3F` stays encoded, so a decoded path
    /// never gains a `?`
    Path,
    /// Query string or form body: `+` is a space
    Form,
}

/// Decodes `src` into `out`, which must be at least as long as `src`.
/// Returns the number of bytes written.
pub(crate) fn percent_decode(src: &[u8], out: &mut [u8], component: Component) -> usize {
    let (mut read, mut written) = (0, 0);

    while read < src.len() {
        let byte = src[read];

        match byte {
            b'%' if read + 2 < src.len() => {
                match (hex_digit(src[read + 1]), hex_digit(src[read + 2])) {
                    (Some(hi), Some(lo)) if component == Component::Path && hi << 4 | lo == b'?' => {
                        out[written..written + 3].copy_from_slice(&src[read..read + 3]);
                        read += 3;
                        written += 2;
                    }
                    (Some(hi), Some(lo)) => {
                        out[written] = hi << 4 | lo;
                        read += 3;
                    }
                    _ => {
                        out[written] = b'%';
                        read += 1;
                    }
                }
            }
            b'+' if component == Component::Form => {
                out[written] = b' ';
                read += 1;
            }
            _ => {
                out[written] = byte;
                read += 1;
            }
        }
        written += 1;
    }

    written
}

/// Decodes `src` straight into a new arena string.
pub(crate) fn intern_decoded(
    arena: &mut Arena,
    src: &[u8],
    component: Component,
) -> Result<PoolStr> {
    let needs_decoding = match component {
        Component::Form => memchr2(b'%', b'+', src).is_some(),
        Component::Path => memchr(b'%', src).is_some(),
    };
    if !needs_decoding {
        return arena.intern_bytes(src);
    }

    let slot = arena.allocate(src.len(), 1)?;
    let written = {
        let out = arena.bytes_mut(&slot).ok_or(Error::StaleHandle)?;
        percent_decode(src, out, component)
    };
    let slot = arena.shrink(slot, written);
    arena.freeze(slot)
}

// ENCODING

/// Appends `value` to `out` in form encoding: unreserved characters are kept,
/// a space becomes `+`, every other byte becomes `%XX`.
pub fn encode_component(value: &str, out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    for &byte in value.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0x0F) as usize] as char);
            }
        }
    }
}

/// Encodes pairs as `k=v&k2=v2`.
///
/// ```
/// use pagecycle::query::encode;
///
/// assert_eq!(encode([("q", "a b"), ("x", "&=")]), "q=a+b&x=%26%3D");
/// ```
pub fn encode<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();

    for (index, (key, value)) in pairs.into_iter().enumerate() {
        if index > 0 {
            out.push('&');
        }
        encode_component(key, &mut out);
        out.push('=');
        encode_component(value, &mut out);
    }

    out
}
