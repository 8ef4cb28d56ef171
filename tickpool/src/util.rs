use std::fmt;

/// Pointer wrapper that formats as a bare hex address.
///
/// Used for tracing fields, where `{:?}` on a reference would chase the
/// pointee instead of printing where it lives.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UsizePtr(pub usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T> From<*const T> for UsizePtr {
    fn from(x: *const T) -> Self {
        Self(x as usize)
    }
}

impl<T> From<*mut T> for UsizePtr {
    fn from(x: *mut T) -> Self {
        Self(x as usize)
    }
}

impl<'a, T> From<&'a T> for UsizePtr {
    fn from(x: &'a T) -> Self {
        Self(x as *const T as usize)
    }
}
