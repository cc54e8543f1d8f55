//! Opaque correlation handles.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Caller-supplied handle returned unchanged in the matching [`Event`].
///
/// Tags compare by identity: two tags are equal only if one is a clone of
/// the other, regardless of any payload they carry. A tag may carry a typed
/// payload for the caller's own bookkeeping.
///
/// [`Event`]: crate::Event
#[derive(Clone)]
pub struct Tag(Arc<dyn Any + Send + Sync>);

impl Tag {
    /// Create a fresh tag with no payload.
    pub fn new() -> Self {
        Self(Arc::new(()))
    }

    /// Create a fresh tag carrying `payload`.
    pub fn with_payload<T: Any + Send + Sync>(payload: T) -> Self {
        Self(Arc::new(payload))
    }

    /// Borrow the payload if it has type `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Identity of this tag, stable for its lifetime.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#x})", self.id())
    }
}
