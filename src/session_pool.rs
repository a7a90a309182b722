//! Bounded pool of pre-allocated sessions for one executor.
//!
//! Capacity is fixed at reservation time by summing, over the phases
//! co-located on the executor, the closed-model user counts and the
//! open-model session estimates. Sessions are allocated eagerly so the hot
//! path never allocates: `acquire` pops a free slot, `release` wipes the
//! session and pushes it back. An empty free list is not an error here — the
//! arrival process decides whether that is a saturation event.

use tracing::debug;

use crate::session::{Session, SessionId};

/// Bounded, reusable pool of sessions.
///
/// The pool owns the session storage; the executor borrows sessions by id
/// (taking them out of their slot for the duration of a tick so the core can
/// be borrowed alongside).
pub struct SessionPool {
    slots: Vec<Option<Session>>,
    free: Vec<SessionId>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Extend capacity by `count` sessions, each with a variable table of
    /// `var_count` slots, allocated eagerly.
    pub fn reserve(&mut self, count: usize, var_count: usize) {
        debug!(count, var_count, "Reserving pool sessions");
        for _ in 0..count {
            let id = SessionId(self.slots.len());
            self.slots.push(Some(Session::new(id, var_count)));
            self.free.push(id);
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pop a free session. `None` means the pool is exhausted.
    pub fn acquire(&mut self) -> Option<SessionId> {
        self.free.pop()
    }

    /// Reset a session and return it to the free list.
    pub fn release(&mut self, id: SessionId) {
        if let Some(session) = self.slots[id.0].as_mut() {
            session.reset();
            debug_assert!(session.is_pristine());
        }
        self.free.push(id);
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// Take a session out of its slot for the duration of a tick.
    pub fn take(&mut self, id: SessionId) -> Option<Session> {
        self.slots.get_mut(id.0).and_then(|s| s.take())
    }

    /// Put a session back into its slot after a tick.
    pub fn restore(&mut self, id: SessionId, session: Session) {
        debug_assert!(self.slots[id.0].is_none());
        self.slots[id.0] = Some(session);
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}
