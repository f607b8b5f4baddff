//! Fd-indexed connection table.
//!
//! The spine is a growable array indexed by file descriptor. Growth only
//! ever extends the spine (it never shrinks), slot writes happen from the
//! owning poller, and a slot is cleared before its fd is handed back to the
//! OS, so an fd number reused after close can never observe a stale entry.

use crate::conn::Conn;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

pub struct ConnTable {
    spine: RwLock<Vec<Option<Arc<Conn>>>>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        let mut spine = Vec::with_capacity(capacity);
        spine.resize_with(capacity, || None);
        Self {
            spine: RwLock::new(spine),
        }
    }

    /// Grow the spine so `fd` is a valid index.
    pub fn ensure(&self, fd: RawFd) {
        let fd = fd as usize;
        {
            let spine = self.spine.read().unwrap_or_else(|e| e.into_inner());
            if fd < spine.len() {
                return;
            }
        }
        let mut spine = self.spine.write().unwrap_or_else(|e| e.into_inner());
        if fd >= spine.len() {
            spine.resize_with(fd + 1024, || None);
        }
    }

    pub fn store(&self, fd: RawFd, conn: Arc<Conn>) {
        let mut spine = self.spine.write().unwrap_or_else(|e| e.into_inner());
        let fd = fd as usize;
        if fd < spine.len() {
            spine[fd] = Some(conn);
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Conn>> {
        let spine = self.spine.read().unwrap_or_else(|e| e.into_inner());
        spine.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Clear the slot, returning the connection that held it. Idempotent.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<Conn>> {
        let mut spine = self.spine.write().unwrap_or_else(|e| e.into_inner());
        spine.get_mut(fd as usize).and_then(|slot| slot.take())
    }

    /// Snapshot of all live connections.
    pub fn snapshot(&self) -> Vec<Arc<Conn>> {
        let spine = self.spine.read().unwrap_or_else(|e| e.into_inner());
        spine.iter().filter_map(|slot| slot.clone()).collect()
    }

    pub fn len(&self) -> usize {
        let spine = self.spine.read().unwrap_or_else(|e| e.into_inner());
        spine.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_and_slot_ops() {
        let table = ConnTable::new(4);
        assert!(table.get(100).is_none());

        table.ensure(5000);
        assert!(table.get(5000).is_none());
        // Double-remove is a no-op.
        assert!(table.remove(5000).is_none());
        assert!(table.remove(5000).is_none());
    }
}
