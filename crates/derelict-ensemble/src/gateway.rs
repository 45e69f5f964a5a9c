//! Bounded, timed calls to blocking evidence collaborators.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{EnsembleError, EvidenceUnavailable};

/// Caps the number of evidence calls in flight and bounds how long a caller waits.
///
/// Each call runs on its own thread and holds a permit until it returns,
/// even after its caller has given up on it, so a hung collaborator keeps
/// occupying its slot. Waiting for a permit and waiting for the result each
/// count against the timeout.
#[derive(Debug, Clone)]
pub struct EvidenceGateway {
    limiter: Arc<Limiter>,
    timeout: Duration,
}

#[derive(Debug)]
struct Limiter {
    in_flight: Mutex<usize>,
    released: Condvar,
    max_in_flight: usize,
}

struct Permit(Arc<Limiter>);

impl Drop for Permit {
    fn drop(&mut self) {
        let mut in_flight = self.0.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *in_flight -= 1;
        self.0.released.notify_one();
    }
}

impl EvidenceGateway {
    /// # Errors
    ///
    /// Returns [`EnsembleError::ZeroBudget`] if `max_in_flight` is zero.
    pub fn new(max_in_flight: usize, timeout: Duration) -> Result<Self, EnsembleError> {
        if max_in_flight == 0 {
            return Err(EnsembleError::ZeroBudget { name: "max_in_flight" });
        }
        Ok(Self {
            limiter: Arc::new(Limiter {
                in_flight: Mutex::new(0),
                released: Condvar::new(),
                max_in_flight,
            }),
            timeout,
        })
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.limiter.max_in_flight
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.limiter.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `call` under a permit and wait at most the timeout for its result.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceUnavailable::TimedOut`] if no permit frees up or the
    /// call does not finish in time; otherwise whatever `call` returns.
    pub fn call<T, F>(&self, call: F) -> Result<T, EvidenceUnavailable>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, EvidenceUnavailable> + Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let permit = self.acquire(deadline)?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = call();
            drop(permit);
            // The receiver is gone if the caller timed out.
            let _ = tx.send(result);
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(self.timed_out()),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EvidenceUnavailable::Upstream {
                message: "evidence call panicked".to_string(),
            }),
        }
    }

    fn acquire(&self, deadline: Instant) -> Result<Permit, EvidenceUnavailable> {
        let limiter = &self.limiter;
        let mut in_flight = limiter.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_flight >= limiter.max_in_flight {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(in_flight = *in_flight, "no evidence permit before deadline");
                return Err(self.timed_out());
            }
            in_flight = limiter
                .released
                .wait_timeout(in_flight, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *in_flight += 1;
        Ok(Permit(Arc::clone(&self.limiter)))
    }

    fn timed_out(&self) -> EvidenceUnavailable {
        EvidenceUnavailable::TimedOut {
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::EvidenceGateway;
    use crate::error::EvidenceUnavailable;

    #[test]
    fn passes_results_through() {
        let gateway = EvidenceGateway::new(2, Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.call(|| Ok(7)).unwrap(), 7);
        assert_eq!(
            gateway.call(|| Err::<u8, _>(EvidenceUnavailable::NoCoverage)),
            Err(EvidenceUnavailable::NoCoverage)
        );
        assert_eq!(gateway.in_flight(), 0);
    }

    #[test]
    fn slow_call_times_out() {
        let gateway = EvidenceGateway::new(1, Duration::from_millis(50)).unwrap();
        let result = gateway.call(|| {
            thread::sleep(Duration::from_millis(500));
            Ok(1)
        });
        assert_eq!(result, Err(EvidenceUnavailable::TimedOut { timeout_ms: 50 }));
    }

    #[test]
    fn never_exceeds_the_bound() {
        let gateway = EvidenceGateway::new(3, Duration::from_secs(10)).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let gateway = gateway.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    gateway.call(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_bound_rejected() {
        assert!(EvidenceGateway::new(0, Duration::from_secs(1)).is_err());
    }
}
