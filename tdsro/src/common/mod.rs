//! Supporting utility type.
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Trace when `verbose` feature enabled.
macro_rules! verbose {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*)
    };
}

/// Create and enter `Span` when `verbose` feature enabled.
macro_rules! span {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        let s = tracing::trace_span!($($tt)*);
        #[cfg(feature = "verbose")]
        let _s = s.enter();
    };
}

/// Debug log when `log` feature enabled.
macro_rules! debug {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($tt)*)
    };
}

/// Warn log when `log` feature enabled.
macro_rules! warn_ {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($tt)*)
    };
}

pub(crate) use verbose;
pub(crate) use span;
pub(crate) use debug;
pub(crate) use warn_ as warn;

/// Lock a std mutex, ignoring poison.
///
/// Guarded state is only mutated by non-panicking bookkeeping, so a poisoned
/// lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server side marker name, e.g. `tdsro00042`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Marker([u8; 10]);

impl Marker {
    pub(crate) fn new(id: u32) -> Self {
        let mut buf = *b"tdsro00000";
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id % 100_000);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        // only ascii letters and digits are ever written
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Marker").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Marker {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod test {
    use super::Marker;

    #[test]
    fn marker_is_zero_padded() {
        assert_eq!(Marker::new(42).as_str(), "tdsro00042");
        assert_eq!(Marker::new(1).as_str(), "tdsro00001");
    }
}
