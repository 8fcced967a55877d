//! Lifecycle state of the service and the pool it owns while running.

use std::sync::RwLock;

use crate::error::{ServiceError, ServiceResult};
use crate::pool::ConnectionPool;

/// Two-state lifecycle guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
}

enum Slot {
    Stopped,
    Running(ConnectionPool),
}

/// Holds the current state; the pool only exists while running.
///
/// `set_running` and `set_stopped` are the only transitions.
pub(crate) struct StateCell {
    slot: RwLock<Slot>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell {
            slot: RwLock::new(Slot::Stopped),
        }
    }

    pub(crate) fn state(&self) -> ServiceState {
        match *self.slot.read().expect("state lock poisoned") {
            Slot::Stopped => ServiceState::Stopped,
            Slot::Running(_) => ServiceState::Running,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Returns the running pool or `NotRunning`.
    pub(crate) fn pool(&self) -> ServiceResult<ConnectionPool> {
        match &*self.slot.read().expect("state lock poisoned") {
            Slot::Running(pool) => Ok(pool.clone()),
            Slot::Stopped => Err(ServiceError::NotRunning),
        }
    }

    pub(crate) fn set_running(&self, pool: ConnectionPool) {
        *self.slot.write().expect("state lock poisoned") = Slot::Running(pool);
    }

    /// Moves to `Stopped`, handing back the pool that was running, if any.
    pub(crate) fn set_stopped(&self) -> Option<ConnectionPool> {
        let previous = std::mem::replace(
            &mut *self.slot.write().expect("state lock poisoned"),
            Slot::Stopped,
        );
        match previous {
            Slot::Running(pool) => Some(pool),
            Slot::Stopped => None,
        }
    }
}
