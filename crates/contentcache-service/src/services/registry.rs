use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Something that can be cancelled through the [`OperationRegistry`].
pub trait Operation: Send + Sync {
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;
}

/// Identifies an owner in the [`OperationRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

type Operations = HashMap<String, Arc<dyn Operation>>;

#[derive(Default)]
struct RegistryInner {
    next_owner: AtomicU64,
    owners: Mutex<HashMap<OwnerId, Operations>>,
}

/// Keeps at most one operation per owner and key.
///
/// Owners are registered explicitly and release their entries when their [`Owner`] guard is
/// dropped. Released operations keep running, but can no longer be reached through the registry.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owners = self.inner.owners.lock().unwrap().len();
        f.debug_struct("OperationRegistry")
            .field("owners", &owners)
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new owner. Its operations are released when the returned guard is dropped.
    pub fn register_owner(&self) -> Owner {
        let id = OwnerId(self.inner.next_owner.fetch_add(1, Ordering::Relaxed));
        self.inner
            .owners
            .lock()
            .unwrap()
            .insert(id, Default::default());
        Owner {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Associates `operation` with `owner` and `key`, cancelling the operation it replaces.
    pub fn associate(&self, owner: OwnerId, key: &str, operation: Arc<dyn Operation>) {
        let prior = {
            let mut owners = self.inner.owners.lock().unwrap();
            match owners.get_mut(&owner) {
                Some(operations) => operations.insert(key.to_owned(), operation),
                None => return,
            }
        };
        if let Some(prior) = prior {
            prior.cancel();
        }
    }

    /// Cancels the operation associated with `owner` and `key`, then starts and associates a new
    /// one.
    ///
    /// The prior operation has received its cancellation by the time `start` is called.
    pub fn associate_with<O, F>(&self, owner: OwnerId, key: &str, start: F) -> O
    where
        O: Operation + Clone + 'static,
        F: FnOnce() -> O,
    {
        self.cancel_and_remove(owner, key);
        let operation = start();
        self.associate(owner, key, Arc::new(operation.clone()));
        operation
    }

    pub fn lookup(&self, owner: OwnerId, key: &str) -> Option<Arc<dyn Operation>> {
        let owners = self.inner.owners.lock().unwrap();
        owners.get(&owner)?.get(key).cloned()
    }

    /// Cancels and removes the operation of `owner` and `key`, if there is one.
    pub fn cancel_and_remove(&self, owner: OwnerId, key: &str) {
        if let Some(operation) = self.remove(owner, key) {
            operation.cancel();
        }
    }

    /// Removes the operation of `owner` and `key` without cancelling it.
    pub fn remove(&self, owner: OwnerId, key: &str) -> Option<Arc<dyn Operation>> {
        let mut owners = self.inner.owners.lock().unwrap();
        owners.get_mut(&owner)?.remove(key)
    }

    /// Forgets `owner` and all of its operations, without cancelling them.
    pub fn release(&self, owner: OwnerId) {
        self.inner.release(owner);
    }

    /// The number of operations associated with `owner`.
    pub fn len(&self, owner: OwnerId) -> usize {
        let owners = self.inner.owners.lock().unwrap();
        owners.get(&owner).map_or(0, HashMap::len)
    }
}

impl RegistryInner {
    fn release(&self, owner: OwnerId) {
        let operations = self.owners.lock().unwrap().remove(&owner);
        if let Some(operations) = operations {
            tracing::trace!(?owner, "Releasing {} operations", operations.len());
        }
    }
}

/// An owner of operations in an [`OperationRegistry`].
///
/// Dropping it releases the owner.
pub struct Owner {
    id: OwnerId,
    registry: Weak<RegistryInner>,
}

impl Owner {
    pub fn id(&self) -> OwnerId {
        self.id
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owner").field(&self.id.0).finish()
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id);
        }
    }
}
