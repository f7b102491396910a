//! Ordered, multi-valued header storage

use crate::{
    arena::{Arena, PoolStr},
    errors::{Malformed, Result},
};
use memchr::memchr;

/// Ordered sequence of `(name, value)` pairs stored in an [`Arena`].
///
/// Names are matched ASCII case-insensitively. Repeated names are kept as
/// separate entries, in the order they were appended.
///
/// ```
/// use pagecycle::{Arena, HeaderContainer};
///
/// let mut arena = Arena::with_capacity(128, 1024);
/// let mut headers = HeaderContainer::default();
///
/// headers.append_str(&mut arena, "Accept", "text/html").unwrap();
/// headers.append_str(&mut arena, "accept", "*/*").unwrap();
///
/// assert_eq!(headers.get(&arena, "ACCEPT"), Some("text/html"));
/// assert_eq!(headers.get_all(&arena, "accept").collect::<Vec<_>>(), ["text/html", "*/*"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeaderContainer {
    entries: Vec<(PoolStr, PoolStr)>,
}

impl HeaderContainer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Appends a pair, even if `name` is already present.
    #[inline(always)]
    pub fn append(&mut self, name: PoolStr, value: PoolStr) {
        self.entries.push((name, value));
    }

    /// Interns both strings in `arena`, then appends them.
    pub fn append_str(&mut self, arena: &mut Arena, name: &str, value: &str) -> Result<()> {
        let name = arena.intern(name)?;
        let value = arena.intern(value)?;
        self.append(name, value);
        Ok(())
    }

    /// Replaces the value of the first entry named `name`, or appends one.
    pub fn set(&mut self, arena: &mut Arena, name: &str, value: &str) -> Result<()> {
        let value = arena.intern(value)?;

        match self.position(arena, name) {
            Some(index) => self.entries[index].1 = value,
            None => {
                let name = arena.intern(name)?;
                self.append(name, value);
            }
        }

        Ok(())
    }

    /// Removes every entry named `name`. Returns how many were removed.
    pub fn remove(&mut self, arena: &Arena, name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(entry, _)| !arena.eq_ignore_case(*entry, name));
        before - self.entries.len()
    }

    /// First value of `name`.
    #[inline]
    pub fn get<'a>(&self, arena: &'a Arena, name: &str) -> Option<&'a str> {
        let index = self.position(arena, name)?;
        arena.get(self.entries[index].1)
    }

    /// Every value of `name`, in insertion order.
    pub fn get_all<'a>(
        &'a self,
        arena: &'a Arena,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(entry, _)| arena.eq_ignore_case(*entry, name))
            .filter_map(|(_, value)| arena.get(*value))
    }

    #[inline]
    pub fn contains(&self, arena: &Arena, name: &str) -> bool {
        self.position(arena, name).is_some()
    }

    /// All pairs in insertion order. Stale handles are skipped.
    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .iter()
            .filter_map(|(name, value)| Some((arena.get(*name)?, arena.get(*value)?)))
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

    #[inline]
    fn position(&self, arena: &Arena, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(entry, _)| arena.eq_ignore_case(*entry, name))
    }
}

/// Splits one header line (without its CRLF) into name and value.
///
/// The value is trimmed of surrounding spaces and tabs. A missing colon, an
/// empty name or whitespace inside the name is [`Malformed::InvalidHeader`].
pub(crate) fn parse_line(line: &[u8]) -> Result<(&[u8], &[u8]), Malformed> {
    let colon = memchr(b':', line).ok_or(Malformed::InvalidHeader)?;
    let name = &line[..colon];

    if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(Malformed::InvalidHeader);
    }

    Ok((name, trim(&line[colon + 1..])))
}

/// `true` if `name` is a non-empty header token.
pub(crate) fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// `true` if `value` can be sent as a header value or reason phrase.
#[inline]
pub(crate) fn is_field_value(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0'))
}

#[inline]
pub(crate) fn trim(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}
