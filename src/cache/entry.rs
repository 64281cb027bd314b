//! Cache entries and the release capability they carry

use std::ops::Deref;
use std::time::{Duration, Instant};

/// Something that holds an external resource which must be closed exactly once
pub trait Release {
    fn release(&self);
}

impl<T: Release + ?Sized> Release for Box<T> {
    fn release(&self) {
        (**self).release()
    }
}

/// A publication owned by the cache.
///
/// Handed out as `Arc<CachedPublication<P>>`. The wrapped resource is released
/// when the last `Arc` goes away, so an entry evicted while a request still
/// holds it stays usable until that request finishes.
pub struct CachedPublication<P: Release> {
    publication: P,
    remote: bool,
    cached_at: Instant,
}

impl<P: Release> CachedPublication<P> {
    pub fn new(publication: P, remote: bool) -> Self {
        Self {
            publication,
            remote,
            cached_at: Instant::now(),
        }
    }

    /// Whether the publication came from a remote backend
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn cached_at(&self) -> Instant {
        self.cached_at
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() >= ttl
    }
}

impl<P: Release> Deref for CachedPublication<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.publication
    }
}

impl<P: Release> Drop for CachedPublication<P> {
    fn drop(&mut self) {
        self.publication.release();
    }
}
