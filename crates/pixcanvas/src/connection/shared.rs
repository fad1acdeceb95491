use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::sync::mutex_lock;

/// Cleanup run when the last [`Lease`] of a shared instance is released.
pub trait Teardown {
    fn teardown(&self);
}

struct SlotInner<T> {
    instance: Option<Arc<T>>,
    leases: usize,
}

/// Lazily created instance shared by every holder of a [`Lease`].
///
/// The first `acquire` creates the instance, releasing the last lease tears
/// it down, and the next `acquire` creates a fresh one.
pub struct SharedSlot<T: Teardown> {
    inner: Mutex<SlotInner<T>>,
}

impl<T: Teardown> SharedSlot<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                instance: None,
                leases: 0,
            }),
        })
    }

    pub fn acquire<E>(self: &Arc<Self>, create: impl FnOnce() -> Result<T, E>) -> Result<Lease<T>, E> {
        let mut inner = mutex_lock(&self.inner, "shared slot");
        let instance = match &inner.instance {
            Some(instance) => Arc::clone(instance),
            None => {
                let instance = Arc::new(create()?);
                inner.instance = Some(Arc::clone(&instance));
                instance
            }
        };
        inner.leases += 1;
        Ok(Lease {
            slot: Arc::clone(self),
            instance,
        })
    }

    pub fn lease_count(&self) -> usize {
        mutex_lock(&self.inner, "shared slot").leases
    }

    pub fn is_active(&self) -> bool {
        mutex_lock(&self.inner, "shared slot").instance.is_some()
    }

    fn release(&self) {
        let released = {
            let mut inner = mutex_lock(&self.inner, "shared slot");
            inner.leases = inner.leases.saturating_sub(1);
            if inner.leases == 0 {
                inner.instance.take()
            } else {
                None
            }
        };
        if let Some(instance) = released {
            instance.teardown();
        }
    }
}

/// Counted handle to the instance of a [`SharedSlot`].
pub struct Lease<T: Teardown> {
    slot: Arc<SharedSlot<T>>,
    instance: Arc<T>,
}

impl<T: Teardown> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

impl<T: Teardown> Clone for Lease<T> {
    fn clone(&self) -> Self {
        mutex_lock(&self.slot.inner, "shared slot").leases += 1;
        Self {
            slot: Arc::clone(&self.slot),
            instance: Arc::clone(&self.instance),
        }
    }
}

impl<T: Teardown> Drop for Lease<T> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

impl<T: Teardown> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("leases", &self.slot.lease_count())
            .finish()
    }
}
