use std::convert::Infallible;
use std::fmt;
use std::future::{Future, IntoFuture, poll_fn};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::lock::{Caller, FlightLock, LockSelector};

type Attempt<T, E> = BoxFuture<'static, Result<T, E>>;

/// The wrapped computation: a factory for attempts, and the attempt currently in flight.
///
/// The in-flight attempt is owned here rather than by the caller driving it, so a caller
/// that gets dropped mid-attempt leaves it behind for the next lock holder to resume.
struct Computation<T, E> {
    factory: Box<dyn FnMut() -> Attempt<T, E> + Send>,
    in_flight: Option<Attempt<T, E>>,
}

/// A snapshot of the state of a [`SingleFlight`].
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<'a, T> {
    /// No attempt has succeeded yet.
    Unresolved,
    /// The computation succeeded and its value is cached.
    Resolved(&'a T),
}

/// A one-shot async computation that can be awaited any number of times, from any number of
/// tasks and threads.
///
/// The computation runs at most once to successful completion. Every caller of
/// [`resolve`](Self::resolve) gets a reference to the same cached value:
///
/// - Once resolved, callers take a fast path that reads the cached value without touching
///   any lock.
/// - Otherwise, callers serialize on a [`FlightLock`], which is created lazily by the
///   configured [`LockSelector`] on first use. After acquiring it, the outcome is checked
///   again, and only a caller that still sees it unresolved drives the computation.
///
/// # Failures
///
/// Failed attempts are not cached. The error is returned to the caller that drove the
/// attempt, the outcome stays unresolved, and the next lock holder starts a fresh attempt
/// through the factory passed to [`from_factory`](Self::from_factory). Computations created
/// with [`new`](Self::new) cannot fail.
///
/// # Cancellation
///
/// Dropping a pending `resolve` future never cancels the computation. The in-flight attempt
/// stays inside the `SingleFlight` and the next lock holder resumes polling it.
pub struct SingleFlight<T, E = Infallible> {
    outcome: OnceLock<T>,
    lock: OnceLock<FlightLock>,
    selector: LockSelector,
    computation: Mutex<Computation<T, E>>,
    attempts: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Send + 'static,
{
    /// Wraps a one-shot `computation`.
    ///
    /// Nothing is polled until the first call to [`resolve`](Self::resolve).
    pub fn new<F>(computation: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut computation = Some(computation);
        Self::from_factory(move || {
            let computation = computation.take();
            async move {
                match computation {
                    Some(computation) => Ok(computation.await),
                    // Only reachable when the first attempt panicked.
                    None => panic!("one-shot computation panicked and cannot be restarted"),
                }
            }
        })
    }
}

impl<T> SingleFlight<T> {
    /// Resolves an infallible computation.
    pub async fn value(&self) -> &T {
        match self.resolve().await {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wraps a computation that is retried on failure.
    ///
    /// Every call of `factory` starts one attempt. It is called again only after an attempt
    /// has failed or panicked.
    pub fn from_factory<F, Fut>(mut factory: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            outcome: OnceLock::new(),
            lock: OnceLock::new(),
            selector: LockSelector::default(),
            computation: Mutex::new(Computation {
                factory: Box::new(move || factory().boxed()),
                in_flight: None,
            }),
            attempts: AtomicU64::new(0),
        }
    }
}

impl<T, E> SingleFlight<T, E> {
    /// Uses `selector` to create the lock on first use.
    pub fn with_selector(mut self, selector: LockSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Resolves the computation from a cooperative task.
    ///
    /// Returns immediately if the outcome is already cached. Otherwise this waits for the
    /// lock and then either picks up the value another caller produced, or drives the
    /// computation itself.
    pub async fn resolve(&self) -> Result<&T, E> {
        if let Some(value) = self.outcome.get() {
            tracing::trace!("outcome cached, skipping lock");
            return Ok(value);
        }

        let lock = self.flight_lock(Caller::Task);
        let _guard = lock.lock().await;

        // Somebody else may have resolved it while we were waiting for the lock.
        if let Some(value) = self.outcome.get() {
            tracing::trace!("outcome resolved while waiting for lock");
            return Ok(value);
        }

        let value = self.run_attempt().await?;
        Ok(self.store(value))
    }

    /// Resolves the computation from a plain OS thread, blocking until done.
    ///
    /// Follows the same protocol as [`resolve`](Self::resolve), but acquires the lock with
    /// [`FlightLock::lock_blocking`] and drives the computation on the calling thread.
    ///
    /// This must not be called from within an async context, as it blocks the executor and
    /// panics inside a `futures` executor.
    pub fn resolve_blocking(&self) -> Result<&T, E> {
        if let Some(value) = self.outcome.get() {
            tracing::trace!("outcome cached, skipping lock");
            return Ok(value);
        }

        let lock = self.flight_lock(Caller::Thread);
        let _guard = lock.lock_blocking();

        if let Some(value) = self.outcome.get() {
            tracing::trace!("outcome resolved while waiting for lock");
            return Ok(value);
        }

        let value = futures::executor::block_on(self.run_attempt())?;
        Ok(self.store(value))
    }

    /// Returns the current outcome without waiting.
    pub fn outcome(&self) -> Outcome<'_, T> {
        match self.outcome.get() {
            Some(value) => Outcome::Resolved(value),
            None => Outcome::Unresolved,
        }
    }

    /// Returns `true` once the computation has succeeded.
    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// The number of attempts that have been started.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Returns the lock, if one was created yet.
    pub fn lock(&self) -> Option<&FlightLock> {
        self.lock.get()
    }

    fn flight_lock(&self, caller: Caller) -> &FlightLock {
        self.lock.get_or_init(|| self.selector.select_lock(caller))
    }

    /// Drives the in-flight attempt to completion, starting a new one if there is none.
    ///
    /// Must only be called while holding the flight lock.
    async fn run_attempt(&self) -> Result<T, E> {
        if self.computation.lock().in_flight.is_some() {
            tracing::debug!("resuming computation abandoned by a cancelled caller");
        }

        let result = poll_fn(|cx| {
            let mut attempt = {
                let mut computation = self.computation.lock();
                match computation.in_flight.take() {
                    Some(attempt) => attempt,
                    None => {
                        let number = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(attempt = number, "starting computation");
                        (computation.factory)()
                    }
                }
            };

            // The attempt is polled without holding the mutex. If it panics, it is dropped
            // and the next lock holder starts over.
            let poll = attempt.as_mut().poll(cx);
            if poll.is_pending() {
                self.computation.lock().in_flight = Some(attempt);
            }
            poll
        })
        .await;

        if result.is_err() {
            tracing::debug!(
                attempts = self.attempts(),
                "computation failed, outcome stays unresolved"
            );
        }
        result
    }

    /// Caches the value of a successful attempt.
    ///
    /// Must only be called while holding the flight lock, after checking the outcome is
    /// still unresolved.
    fn store(&self, value: T) -> &T {
        let value = self.outcome.get_or_init(move || value);
        tracing::debug!(attempts = self.attempts(), "computation resolved");
        value
    }
}

impl<'a, T, E> IntoFuture for &'a SingleFlight<T, E>
where
    T: Send + Sync,
    E: Send,
{
    type Output = Result<&'a T, E>;
    type IntoFuture = BoxFuture<'a, Result<&'a T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        self.resolve().boxed()
    }
}

impl<T, E> fmt::Debug for SingleFlight<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("resolved", &self.is_resolved())
            .field("attempts", &self.attempts())
            .field("lock", &self.lock.get())
            .finish()
    }
}
