use std::fmt;

/// One-shot completion callback of a page run.
///
/// The driver consumes the token with [`complete`](Completion::complete)
/// once the page is finalized. The callback can only run once: if the token
/// is dropped unconsumed (early return, panic unwinding), `Drop` fires it and
/// logs a warning.
///
/// ```
/// use pagecycle::Completion;
/// use std::cell::Cell;
///
/// let calls = Cell::new(0);
/// let token = Completion::new(|| calls.set(calls.get() + 1));
///
/// token.complete();
/// assert_eq!(calls.get(), 1);
///
/// drop(Completion::new(|| calls.set(calls.get() + 1)));
/// assert_eq!(calls.get(), 2);
/// ```
pub struct Completion<'a> {
    callback: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Completion<'a> {
    pub fn new<F: FnOnce() + 'a>(callback: F) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// A token with nothing to call.
    pub fn noop() -> Self {
        Self { callback: None }
    }

    /// Runs the callback.
    #[inline]
    pub fn complete(mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::warn!("page completion dropped before finalize, firing it now");
            callback();
        }
    }
}

impl fmt::Debug for Completion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn fires_exactly_once() {
        let calls = Cell::new(0);

        let token = Completion::new(|| calls.set(calls.get() + 1));
        assert_eq!(format!("{token:?}"), "Completion { pending: true }");
        token.complete();
        assert_eq!(calls.get(), 1);

        {
            let _token = Completion::new(|| calls.set(calls.get() + 1));
        }
        assert_eq!(calls.get(), 2);

        Completion::noop().complete();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn fires_during_unwinding() {
        let calls = Cell::new(0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _token = Completion::new(|| calls.set(calls.get() + 1));
            panic!("page panicked");
        }));

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
