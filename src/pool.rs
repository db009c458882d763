//! Fixed-capacity resource pools.
//!
//! Pools bound the memory a transport can claim: when every item is out,
//! [`Pool::acquire`] waits until one comes back instead of allocating. Items
//! are handed out in RAII guards that return them on drop, on every exit
//! path including errors and panics.
//!
//! - [`Pool<T>`] - lazily filled pool of reusable values (packet scratch)
//! - [`OpaquePool`] - leases of unique opaque ids from a contiguous range

use std::fmt;
use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{GofastError, Result};

type Factory<T> = dyn Fn() -> T + Send + Sync;

struct PoolInner<T> {
    permits: Arc<Semaphore>,
    items: Mutex<Vec<T>>,
    make: Box<Factory<T>>,
    capacity: usize,
}

/// Fixed-capacity pool of reusable values.
///
/// Cheaply cloneable; clones share the same items.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool of at most `capacity` items built by `make` on demand.
    pub fn new<F>(capacity: usize, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(capacity)),
                items: Mutex::new(Vec::with_capacity(capacity)),
                make: Box::new(make),
                capacity,
            }),
        }
    }

    /// Take an item, waiting while the pool is exhausted.
    ///
    /// Fails with [`GofastError::ConnectionClosed`] once the pool is closed.
    pub async fn acquire(&self) -> Result<Pooled<T>> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GofastError::ConnectionClosed)?;
        Ok(self.checkout(permit))
    }

    /// Take an item without waiting. `None` when exhausted or closed.
    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(self.checkout(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Pooled<T> {
        let item = self.inner.items.lock().pop();
        let item = item.unwrap_or_else(|| (self.inner.make)());
        Pooled {
            item: Some(item),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Wake every waiter with an error and refuse further acquisitions.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Items currently available without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.inner.permits.available_permits())
            .finish()
    }
}

/// An item checked out of a [`Pool`]; returned on drop.
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
    // Released after the item is back in the free list.
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop.
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.items.lock().push(item);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

struct OpaqueState {
    free: Vec<u64>,
    next: u64,
}

struct OpaqueInner {
    permits: Arc<Semaphore>,
    state: Mutex<OpaqueState>,
    range: Range<u64>,
}

/// Hands out unique opaque ids from a contiguous range.
///
/// No two live [`OpaqueLease`]s share a value. When every id is leased,
/// [`lease`](OpaquePool::lease) waits for one to be released.
#[derive(Clone)]
pub struct OpaquePool {
    inner: Arc<OpaqueInner>,
}

impl OpaquePool {
    /// Create a pool over `range`.
    ///
    /// Fails on an empty range or one larger than a semaphore can count.
    pub fn new(range: Range<u64>) -> Result<Self> {
        let size = range.end.saturating_sub(range.start);
        if size == 0 {
            return Err(GofastError::Config(format!(
                "empty opaque range {:#x}..{:#x}",
                range.start, range.end
            )));
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|&s| s <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| GofastError::Config(format!("opaque range of {size} ids too large")))?;

        Ok(Self {
            inner: Arc::new(OpaqueInner {
                permits: Arc::new(Semaphore::new(size)),
                state: Mutex::new(OpaqueState {
                    free: Vec::new(),
                    next: range.start,
                }),
                range,
            }),
        })
    }

    /// Lease an unused opaque, waiting while the range is exhausted.
    pub async fn lease(&self) -> Result<OpaqueLease> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GofastError::ConnectionClosed)?;
        Ok(self.checkout(permit))
    }

    /// Lease without waiting. `None` when exhausted or closed.
    pub fn try_lease(&self) -> Option<OpaqueLease> {
        self.inner
            .permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.checkout(permit))
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> OpaqueLease {
        let mut state = self.inner.state.lock();
        // A permit guarantees either a free id or room in the range.
        let value = match state.free.pop() {
            Some(value) => value,
            None => {
                let value = state.next;
                state.next += 1;
                value
            }
        };
        OpaqueLease {
            value,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Wake every waiter with an error and refuse further leases.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    /// The range ids are drawn from.
    pub fn range(&self) -> Range<u64> {
        self.inner.range.clone()
    }

    /// True if `opaque` belongs to this pool's range.
    #[inline]
    pub fn contains(&self, opaque: u64) -> bool {
        self.inner.range.contains(&opaque)
    }

    /// Number of ids currently leased.
    pub fn leased(&self) -> usize {
        let size = (self.inner.range.end - self.inner.range.start) as usize;
        size - self.inner.permits.available_permits()
    }
}

impl fmt::Debug for OpaquePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaquePool")
            .field("range", &self.inner.range)
            .field("leased", &self.leased())
            .finish()
    }
}

/// A leased opaque id; released on drop.
pub struct OpaqueLease {
    value: u64,
    pool: Arc<OpaqueInner>,
    _permit: OwnedSemaphorePermit,
}

impl OpaqueLease {
    /// The leased id.
    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl Drop for OpaqueLease {
    fn drop(&mut self) {
        self.pool.state.lock().free.push(self.value);
    }
}

impl fmt::Debug for OpaqueLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueLease({:#x})", self.value)
    }
}
