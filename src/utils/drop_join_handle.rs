use std::ops::Deref;

use tokio::task::JoinHandle;

/// Cancels a tokio task when dropped, unless [`Self::into_inner`] has
/// already handed the raw handle off to a caller that wants to await it
/// instead.
pub struct OwnedJoinHandle<T>(Option<JoinHandle<T>>);

impl<T> OwnedJoinHandle<T> {
    pub fn new(inner: JoinHandle<T>) -> Self {
        Self(Some(inner))
    }

    /// Takes ownership of the underlying `JoinHandle` without aborting it,
    /// for callers that need to await task completion (e.g. `Stop()`
    /// joining the maintenance loop) rather than rely on abort-on-drop.
    pub fn into_inner(mut self) -> JoinHandle<T> {
        self.0.take().expect("handle already taken")
    }
}

impl<T> Deref for OwnedJoinHandle<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref().expect("handle already taken")
    }
}

impl<T> Drop for OwnedJoinHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

impl<T> From<JoinHandle<T>> for OwnedJoinHandle<T> {
    fn from(from: JoinHandle<T>) -> Self {
        Self::new(from)
    }
}
