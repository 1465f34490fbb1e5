use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use deadpool_postgres::Object;

use super::PoolInner;

/// A checked-out connection.
///
/// Dereferences to the pooled client (`deadpool_postgres::Object`, which in turn
/// dereferences to `tokio_postgres::Client`). Dropping it returns it to its pool,
/// so a panic or a cancelled future cannot leak it.
pub struct PooledConnection {
    object: Object,
    owner: Arc<PoolInner>,
}

impl PooledConnection {
    pub(super) fn new(object: Object, owner: Arc<PoolInner>) -> Self {
        Self { object, owner }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.owner.id
    }

    /// Mutable access to the pooled object, needed to open a transaction.
    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }
}

impl Deref for PooledConnection {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Object {
        &mut self.object
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // The object itself goes back to deadpool after this, when its field drops.
        self.owner.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.owner.id)
            .field("closed", &self.object.is_closed())
            .finish()
    }
}
