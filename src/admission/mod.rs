//! Admission control with backpressure
//!
//! A request is admitted immediately while fewer than `max_concurrent`
//! requests are executing. Otherwise it waits in a bounded FIFO queue until a
//! finishing request hands its slot over, or until its deadline passes. When
//! the queue is full the request is rejected on the spot.
//!
//! Slots are handed from a finishing request directly to the oldest waiter,
//! so the in-flight count never dips below the limit while anyone is queued.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ManagerError;
use crate::pool::{BreakerTicket, CircuitBreaker};

/// Queue deadline used when the caller does not pick one
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

type Grant = Result<(), ManagerError>;

struct Waiter {
    id: u64,
    grant: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct AdmissionState {
    current: usize,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
    total_admitted: u64,
    total_queued: u64,
    total_queue_full: u64,
    total_queue_timeouts: u64,
    total_circuit_rejections: u64,
}

/// Counters describing admission activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Requests currently executing
    pub in_flight: usize,

    /// Requests currently waiting
    pub queue_length: usize,

    pub total_admitted: u64,
    pub total_queued: u64,
    pub total_queue_full: u64,
    pub total_queue_timeouts: u64,
    pub total_circuit_rejections: u64,
}

/// Gate deciding whether a request runs now, waits, or is rejected
pub struct AdmissionController {
    breaker: Arc<CircuitBreaker>,
    max_concurrent: usize,
    max_queue_size: usize,
    state: Mutex<AdmissionState>,

    /// Signalled when the in-flight count drops to zero
    drained: Notify,
}

/// A request cleared to execute
#[derive(Debug)]
pub struct Admitted {
    /// Concurrency slot, released on drop
    pub permit: AdmissionPermit,

    /// Circuit breaker admission, to be settled with the request outcome
    pub ticket: BreakerTicket,

    /// Time spent in the wait queue
    pub waited: Duration,
}

impl AdmissionController {
    pub fn new(breaker: Arc<CircuitBreaker>, max_concurrent: usize, max_queue_size: usize) -> Arc<Self> {
        Arc::new(Self {
            breaker,
            max_concurrent,
            max_queue_size,
            state: Mutex::new(AdmissionState::default()),
            drained: Notify::new(),
        })
    }

    /// Admit a request, queueing it until `deadline` if the system is at capacity
    pub async fn admit(self: &Arc<Self>, deadline: Instant) -> Result<Admitted, ManagerError> {
        if self.state.lock().closed {
            return Err(ManagerError::ShuttingDown);
        }

        let ticket = match self.breaker.try_acquire() {
            Ok(ticket) => ticket,
            Err(e) => {
                self.state.lock().total_circuit_rejections += 1;
                debug!(error = %e, "Request rejected by circuit breaker");
                return Err(ManagerError::CircuitOpen { retry_in: e.retry_in() });
            }
        };

        let enqueued_at = Instant::now();
        let (id, rx) = {
            let mut state = self.state.lock();

            if state.closed {
                return Err(ManagerError::ShuttingDown);
            }

            if state.current < self.max_concurrent {
                state.current += 1;
                state.total_admitted += 1;
                return Ok(Admitted {
                    permit: AdmissionPermit::new(Arc::clone(self)),
                    ticket,
                    waited: Duration::ZERO,
                });
            }

            if state.queue.len() >= self.max_queue_size {
                state.total_queue_full += 1;
                debug!(
                    queue_length = state.queue.len(),
                    "Wait queue full, rejecting request"
                );
                return Err(ManagerError::QueueFull {
                    capacity: self.max_queue_size,
                });
            }

            state.next_waiter += 1;
            let id = state.next_waiter;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { id, grant: tx });
            state.total_queued += 1;
            debug!(
                waiter = id,
                queue_length = state.queue.len(),
                "Request queued"
            );
            (id, rx)
        };

        let mut waiting = QueuedRequest {
            controller: self,
            id,
            rx,
            settled: false,
        };

        let grant = match tokio::time::timeout_at(deadline, &mut waiting.rx).await {
            Ok(grant) => grant,
            Err(_) => {
                // Dropping `waiting` removes it from the queue, or passes on a
                // slot granted in the meantime.
                drop(waiting);
                let waited = enqueued_at.elapsed();
                self.state.lock().total_queue_timeouts += 1;
                debug!(waiter = id, waited_ms = waited.as_millis() as u64, "Queued request timed out");
                return Err(ManagerError::QueueTimeout { waited });
            }
        };
        waiting.settled = true;

        match grant {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ManagerError::ShuttingDown),
        }

        let permit = AdmissionPermit::new(Arc::clone(self));
        self.state.lock().total_admitted += 1;

        // The breaker may have tripped while this request was waiting
        let ticket = self
            .breaker
            .revalidate(ticket)
            .map_err(|e| ManagerError::CircuitOpen { retry_in: e.retry_in() })?;

        Ok(Admitted {
            permit,
            ticket,
            waited: enqueued_at.elapsed(),
        })
    }

    /// Free one slot: hand it to the oldest waiter, or decrement the in-flight count
    fn release_locked(&self, state: &mut AdmissionState) {
        while let Some(waiter) = state.queue.pop_front() {
            if waiter.grant.send(Ok(())).is_ok() {
                debug!(waiter = waiter.id, "Slot handed to queued request");
                return;
            }
        }

        state.current = state.current.saturating_sub(1);
        if state.current == 0 {
            self.drained.notify_waiters();
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
    }

    /// Stop admitting and reject everything still queued
    pub fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;

        let rejected = state.queue.len();
        for waiter in state.queue.drain(..) {
            let _ = waiter.grant.send(Err(ManagerError::ShuttingDown));
        }

        if rejected > 0 {
            info!(rejected, "Rejected queued requests on shutdown");
        }
        if state.current == 0 {
            self.drained.notify_waiters();
        }
        rejected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until no admitted request is executing
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().current == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn current_requests(&self) -> usize {
        self.state.lock().current
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            in_flight: state.current,
            queue_length: state.queue.len(),
            total_admitted: state.total_admitted,
            total_queued: state.total_queued,
            total_queue_full: state.total_queue_full,
            total_queue_timeouts: state.total_queue_timeouts,
            total_circuit_rejections: state.total_circuit_rejections,
        }
    }
}

/// A request's place in the wait queue
struct QueuedRequest<'a> {
    controller: &'a AdmissionController,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut state = self.controller.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
            state.queue.remove(pos);
            return;
        }

        // Already dequeued: a slot granted to us must not be lost
        if let Ok(Ok(())) = self.rx.try_recv() {
            self.controller.release_locked(&mut state);
        }
    }
}

/// One unit of the concurrency budget, returned on drop
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl AdmissionPermit {
    fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}
