//! Concurrency gates.
//!
//! Two independent counting semaphores bound how much background work runs
//! at once: the `general` gate for light jobs and the `heavy` gate for
//! document/AI processing. A job acquires exactly one gate, chosen by its
//! class, and holds the permit for the whole fetch.
//!
//! ```ignore
//! let gates = ConcurrencyGates::new(5, 1)?;
//! let _permit = gates.acquire(JobClass::Heavy, &mut shutdown).await?;
//! // fetch runs here; the slot frees when `_permit` drops (also on panic)
//! ```

use crate::application::worker::ShutdownToken;
use crate::domain::JobClass;
use crate::error::{AppError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Gate acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Gate '{0}' wait cancelled by shutdown")]
    Cancelled(&'static str),
}

/// One bounded gate with in-flight accounting
#[derive(Debug)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    label: &'static str,
}

impl Gate {
    /// Creates a gate with `capacity` slots. Zero is rejected.
    pub fn new(capacity: usize, label: &'static str) -> Result<Self> {
        if capacity == 0 {
            return Err(AppError::Config(format!(
                "gate '{}' capacity must be > 0",
                label
            )));
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            label,
        })
    }

    /// Waits for a slot or for shutdown, whichever comes first.
    ///
    /// Waiters are served in FIFO order.
    pub async fn acquire(
        &self,
        shutdown: &mut ShutdownToken,
    ) -> std::result::Result<GatePermit, GateError> {
        if shutdown.is_shutdown() {
            return Err(GateError::Cancelled(self.label));
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.wait() => return Err(GateError::Cancelled(self.label)),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };

        // The semaphore is never closed while the gate is alive
        let permit = permit.map_err(|_| GateError::Cancelled(self.label))?;

        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        debug!(gate = self.label, in_flight = current, "Gate slot acquired");

        Ok(GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    pub fn occupancy(&self) -> GateOccupancy {
        GateOccupancy {
            label: self.label,
            capacity: self.capacity,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
        }
    }
}

/// RAII slot; releases the gate when dropped, including during unwinding
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a gate, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateOccupancy {
    pub label: &'static str,
    pub capacity: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

/// The general + heavy gate pair
#[derive(Debug)]
pub struct ConcurrencyGates {
    general: Gate,
    heavy: Gate,
}

impl ConcurrencyGates {
    pub fn new(max_concurrent: usize, heavy_job_limit: usize) -> Result<Self> {
        Ok(Self {
            general: Gate::new(max_concurrent, "general")?,
            heavy: Gate::new(heavy_job_limit, "heavy")?,
        })
    }

    /// Gate used by jobs of `class`
    pub fn for_class(&self, class: JobClass) -> &Gate {
        match class {
            JobClass::Light => &self.general,
            JobClass::Heavy => &self.heavy,
        }
    }

    pub async fn acquire(
        &self,
        class: JobClass,
        shutdown: &mut ShutdownToken,
    ) -> std::result::Result<GatePermit, GateError> {
        self.for_class(class).acquire(shutdown).await
    }

    pub fn general(&self) -> &Gate {
        &self.general
    }

    pub fn heavy(&self) -> &Gate {
        &self.heavy
    }

    pub fn occupancy(&self) -> Vec<GateOccupancy> {
        vec![self.general.occupancy(), self.heavy.occupancy()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::{shutdown_channel, TaskRunner};
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(ConcurrencyGates::new(0, 1), Err(AppError::Config(_))));
        assert!(matches!(ConcurrencyGates::new(5, 0), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_classes_use_independent_gates() {
        let gates = ConcurrencyGates::new(2, 1).unwrap();
        let (_tx, mut token) = shutdown_channel();

        let _heavy = gates.acquire(JobClass::Heavy, &mut token).await.unwrap();
        let _light_a = gates.acquire(JobClass::Light, &mut token).await.unwrap();
        let _light_b = gates.acquire(JobClass::Light, &mut token).await.unwrap();

        assert_eq!(gates.heavy().in_flight(), 1);
        assert_eq!(gates.general().in_flight(), 2);
    }

    #[test]
    fn test_waiter_blocks_until_release() {
        let gate = Gate::new(1, "heavy").unwrap();
        let (_tx, token) = shutdown_channel();

        let mut first_token = token.clone();
        let mut first = task::spawn(gate.acquire(&mut first_token));
        let permit = assert_ready!(first.poll()).unwrap();
        drop(first);

        let mut second_token = token.clone();
        let mut second = task::spawn(gate.acquire(&mut second_token));
        assert_pending!(second.poll());

        drop(permit);
        assert!(second.is_woken());
        let _permit = assert_ready!(second.poll()).unwrap();
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn test_waiter_cancelled_by_shutdown() {
        let gate = Gate::new(1, "heavy").unwrap();
        let (tx, token) = shutdown_channel();

        let mut holder_token = token.clone();
        let held = assert_ready!(task::spawn(gate.acquire(&mut holder_token)).poll()).unwrap();

        let mut waiter_token = token.clone();
        let mut waiter = task::spawn(gate.acquire(&mut waiter_token));
        assert_pending!(waiter.poll());

        tx.shutdown();
        assert!(waiter.is_woken());
        let result = assert_ready!(waiter.poll());
        assert_eq!(result.unwrap_err(), GateError::Cancelled("heavy"));

        drop(held);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails_fast() {
        let gate = Gate::new(3, "general").unwrap();
        let (tx, mut token) = shutdown_channel();
        tx.shutdown();

        assert!(gate.acquire(&mut token).await.is_err());
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_permit_released_when_holder_panics() {
        let gates = Arc::new(ConcurrencyGates::new(5, 1).unwrap());
        let runner = TaskRunner::new();
        let (_tx, token) = shutdown_channel();

        for _ in 0..4 {
            let gates = Arc::clone(&gates);
            let mut token = token.clone();
            let outcome: crate::application::worker::TaskOutcome<()> = runner
                .run("panicking-heavy", async move {
                    let _permit = gates.acquire(JobClass::Heavy, &mut token).await.unwrap();
                    panic!("holder panicked");
                })
                .await;
            assert!(outcome.is_panicked());
        }

        assert_eq!(gates.heavy().in_flight(), 0);
        assert_eq!(gates.heavy().peak_in_flight(), 1);

        let mut token = token.clone();
        let permit = tokio::time::timeout(
            Duration::from_secs(1),
            gates.acquire(JobClass::Heavy, &mut token),
        )
        .await;
        assert!(permit.is_ok());
    }
}
