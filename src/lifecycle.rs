//! Process-wide broker instance.
//!
//! The first caller builds the broker from the environment; every later caller gets the
//! same `Arc<Broker>`. Construction happens under a mutex, so concurrent first callers
//! never create two tunnels. [`shutdown`] empties the slot; the next [`instance`] call
//! builds a fresh broker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// A lazily initialized, resettable shared value.
#[derive(Debug)]
pub struct ProcessSlot<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> ProcessSlot<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the current value, building it with `init` if the slot is empty.
    ///
    /// `init` runs at most once at a time; callers arriving meanwhile wait and then
    /// share its result. A failed `init` leaves the slot empty.
    ///
    /// # Errors
    /// Whatever `init` returns.
    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut guard = self.lock();
        if let Some(existing) = guard.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let value = Arc::new(init()?);
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }

    /// Empty the slot and hand back what it held.
    pub fn take(&self) -> Option<Arc<T>> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for ProcessSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

static BROKER: ProcessSlot<Broker> = ProcessSlot::new();

/// The process-wide broker, built from environment configuration on first use.
///
/// # Errors
/// `BrokerError::MissingConfiguration` when required keys are absent, otherwise
/// any error from [`Broker::connect`]. Nothing stays open after a failure.
pub fn instance() -> Result<Arc<Broker>, BrokerError> {
    BROKER.get_or_try_init(|| Broker::connect(BrokerConfig::from_env()?))
}

/// Like [`instance`], but builds from `config` when no broker exists yet.
///
/// `config` is ignored when a broker is already running.
///
/// # Errors
/// See [`Broker::connect`].
pub fn instance_with(config: BrokerConfig) -> Result<Arc<Broker>, BrokerError> {
    BROKER.get_or_try_init(|| Broker::connect(config))
}

/// The running process-wide broker, if any.
#[must_use]
pub fn current() -> Option<Arc<Broker>> {
    BROKER.get()
}

/// Shut down the process-wide broker: pool first, then tunnel.
///
/// Calling it again, or before any [`instance`] call, does nothing. Handles still held
/// elsewhere stay valid but every query on them returns `NoResult`.
pub fn shutdown() {
    if let Some(broker) = BROKER.take() {
        broker.shutdown();
    }
}
