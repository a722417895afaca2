use std::fmt;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;

use serde::Deserialize;
use thiserror::Error;

use crate::config::SelectorConfig;

/// The mutual-exclusion backends a [`LockSelector`] knows about.
///
/// The declaration order is the selection priority. [`Thread`](Self::Thread) is always last
/// and always constructible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockBackend {
    /// [`tokio::sync::Mutex`], usable when a Tokio runtime is driving the current thread.
    Tokio,
    /// `async_lock::Mutex`, the lock used across the smol / async-std ecosystem.
    AsyncLock,
    /// [`futures::lock::Mutex`], which works on any executor.
    Futures,
    /// A plain [`parking_lot::Mutex`] that blocks the OS thread.
    Thread,
}

impl LockBackend {
    /// All backends, in the order they are tried.
    pub const PRIORITY: [LockBackend; 4] = [
        LockBackend::Tokio,
        LockBackend::AsyncLock,
        LockBackend::Futures,
        LockBackend::Thread,
    ];

    /// Returns the name used in configuration files and log output.
    pub fn as_str(self) -> &'static str {
        match self {
            LockBackend::Tokio => "tokio",
            LockBackend::AsyncLock => "async-lock",
            LockBackend::Futures => "futures",
            LockBackend::Thread => "thread",
        }
    }

    /// Checks whether this backend can serve `caller` right now.
    fn probe(self, caller: Caller) -> Result<(), Unavailable> {
        match self {
            LockBackend::Tokio => probe_tokio(),
            LockBackend::AsyncLock => {
                if !cfg!(feature = "async-lock") {
                    return Err(Unavailable::NotCompiled("async-lock"));
                }
                caller.require_task()
            }
            LockBackend::Futures => caller.require_task(),
            LockBackend::Thread => Ok(()),
        }
    }

    /// Probes and constructs a lock for this backend.
    fn try_construct(self, caller: Caller) -> Result<FlightLock, Unavailable> {
        self.probe(caller)?;
        let inner = match self {
            #[cfg(feature = "tokio")]
            LockBackend::Tokio => RawLock::Tokio(tokio::sync::Mutex::new(())),
            #[cfg(feature = "async-lock")]
            LockBackend::AsyncLock => RawLock::AsyncLock(async_lock::Mutex::new(())),
            LockBackend::Futures => RawLock::Futures(futures::lock::Mutex::new(())),
            LockBackend::Thread => return Ok(FlightLock::thread()),
            #[allow(unreachable_patterns)]
            _ => return Err(Unavailable::NotCompiled(self.feature())),
        };
        Ok(FlightLock::from_raw(self, inner))
    }

    fn feature(self) -> &'static str {
        match self {
            LockBackend::Tokio => "tokio",
            LockBackend::AsyncLock => "async-lock",
            LockBackend::Futures | LockBackend::Thread => "default",
        }
    }
}

impl fmt::Display for LockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(feature = "tokio")]
fn probe_tokio() -> Result<(), Unavailable> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| Unavailable::NoRuntime)
}

#[cfg(not(feature = "tokio"))]
fn probe_tokio() -> Result<(), Unavailable> {
    Err(Unavailable::NotCompiled("tokio"))
}

/// The kind of caller that triggers lock selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Caller {
    /// A cooperative task that is being polled by some executor and may suspend.
    Task,
    /// A plain OS thread that blocks until the lock is available.
    Thread,
}

impl Caller {
    fn require_task(self) -> Result<(), Unavailable> {
        match self {
            Caller::Task => Ok(()),
            Caller::Thread => Err(Unavailable::NotATask),
        }
    }
}

/// The reason a [`LockBackend`] was skipped during selection.
///
/// None of these are errors: they only move the selection on to the next candidate.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Unavailable {
    /// The backend was disabled through the [`SelectorConfig`].
    #[error("disabled by configuration")]
    Disabled,
    /// The crate was built without the backend's cargo feature.
    #[error("not compiled in (enable the `{0}` feature)")]
    NotCompiled(&'static str),
    /// There is no Tokio runtime on the current thread.
    #[error("no Tokio runtime on the current thread")]
    NoRuntime,
    /// The caller blocks an OS thread instead of running as a cooperative task.
    #[error("caller is not a cooperative task")]
    NotATask,
}

/// A backend that was considered and skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// The skipped backend.
    pub backend: LockBackend,
    /// Why it was skipped.
    pub reason: Unavailable,
}

/// The result of running the selection chain.
#[derive(Debug)]
pub struct Selection {
    /// The constructed lock.
    pub lock: FlightLock,
    /// Every candidate that was tried before `lock`, in priority order.
    pub rejected: Vec<Rejection>,
}

impl Selection {
    /// The backend of the selected lock.
    pub fn backend(&self) -> LockBackend {
        self.lock.backend()
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "selected {}", self.backend())?;
        for rejection in &self.rejected {
            write!(f, "\nrejected {}: {}", rejection.backend, rejection.reason)?;
        }
        Ok(())
    }
}

/// Picks a [`FlightLock`] backend that fits whatever concurrency runtime is live at the time
/// of the call.
///
/// Candidates are tried in [`LockBackend::PRIORITY`] order and the first one that can be
/// constructed wins. The [`Thread`](LockBackend::Thread) mutex terminates the chain, so
/// selection never fails.
#[derive(Clone, Debug, Default)]
pub struct LockSelector {
    config: SelectorConfig,
}

impl LockSelector {
    /// Creates a selector that honors `config`.
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Excludes `backend` from selection.
    ///
    /// Disabling [`LockBackend::Thread`] has no effect, the fallback always stays available.
    pub fn disable(mut self, backend: LockBackend) -> Self {
        if backend != LockBackend::Thread {
            self.config.disabled.insert(backend);
        }
        self
    }

    /// Runs the selection chain for `caller`.
    pub fn select(&self, caller: Caller) -> Selection {
        let mut rejected = Vec::new();

        let lock = LockBackend::PRIORITY.into_iter().find_map(|backend| {
            // the fallback terminates the chain even if a config lists it
            let attempt = if backend != LockBackend::Thread && self.config.is_disabled(backend) {
                Err(Unavailable::Disabled)
            } else {
                backend.try_construct(caller)
            };

            match attempt {
                Ok(lock) => {
                    tracing::debug!(
                        backend = %backend,
                        caller = ?caller,
                        rejected = rejected.len(),
                        "selected lock backend"
                    );
                    Some(lock)
                }
                Err(reason) => {
                    tracing::debug!(backend = %backend, %reason, "lock backend unavailable");
                    rejected.push(Rejection { backend, reason });
                    None
                }
            }
        });

        Selection {
            lock: lock.unwrap_or_else(FlightLock::thread),
            rejected,
        }
    }

    /// Runs the selection chain and returns only the lock.
    pub fn select_lock(&self, caller: Caller) -> FlightLock {
        self.select(caller).lock
    }
}

enum RawLock {
    #[cfg(feature = "tokio")]
    Tokio(tokio::sync::Mutex<()>),
    #[cfg(feature = "async-lock")]
    AsyncLock(async_lock::Mutex<()>),
    Futures(futures::lock::Mutex<()>),
    Thread(parking_lot::Mutex<()>),
}

/// A mutual-exclusion handle produced by a [`LockSelector`].
///
/// Cooperative backends suspend in [`lock`](Self::lock), the thread backend blocks. Both
/// kinds can also be acquired from plain OS threads through
/// [`lock_blocking`](Self::lock_blocking).
pub struct FlightLock {
    backend: LockBackend,
    raw: RawLock,
    acquisitions: AtomicU64,
}

impl FlightLock {
    fn from_raw(backend: LockBackend, raw: RawLock) -> Self {
        Self {
            backend,
            raw,
            acquisitions: AtomicU64::new(0),
        }
    }

    fn thread() -> Self {
        Self::from_raw(
            LockBackend::Thread,
            RawLock::Thread(parking_lot::Mutex::new(())),
        )
    }

    /// The backend this lock was constructed for.
    pub fn backend(&self) -> LockBackend {
        self.backend
    }

    /// The number of times this lock has been acquired so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Acquires the lock from a cooperative task.
    ///
    /// This suspends for every backend. While the thread backend is contended, the task
    /// yields back to its executor and retries on the next poll.
    pub async fn lock(&self) -> FlightGuard<'_> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let inner = match &self.raw {
            #[cfg(feature = "tokio")]
            RawLock::Tokio(mutex) => Guard::Tokio {
                _guard: mutex.lock().await,
            },
            #[cfg(feature = "async-lock")]
            RawLock::AsyncLock(mutex) => Guard::AsyncLock {
                _guard: mutex.lock().await,
            },
            RawLock::Futures(mutex) => Guard::Futures {
                _guard: mutex.lock().await,
            },
            RawLock::Thread(mutex) => Guard::Thread {
                _guard: poll_fn(|cx| match mutex.try_lock() {
                    Some(guard) => Poll::Ready(guard),
                    None => {
                        // the holder may be a suspended task on this very thread
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                })
                .await,
            },
        };
        FlightGuard { _inner: inner }
    }

    /// Acquires the lock from a plain OS thread, blocking until it is available.
    ///
    /// Must not be called from within a `futures` executor, as cooperative backends are
    /// driven with [`futures::executor::block_on`].
    pub fn lock_blocking(&self) -> FlightGuard<'_> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let inner = match &self.raw {
            #[cfg(feature = "tokio")]
            RawLock::Tokio(mutex) => Guard::Tokio {
                _guard: futures::executor::block_on(mutex.lock()),
            },
            #[cfg(feature = "async-lock")]
            RawLock::AsyncLock(mutex) => Guard::AsyncLock {
                _guard: futures::executor::block_on(mutex.lock()),
            },
            RawLock::Futures(mutex) => Guard::Futures {
                _guard: futures::executor::block_on(mutex.lock()),
            },
            RawLock::Thread(mutex) => Guard::Thread {
                _guard: mutex.lock(),
            },
        };
        FlightGuard { _inner: inner }
    }
}

impl fmt::Debug for FlightLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightLock")
            .field("backend", &self.backend)
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}

enum Guard<'a> {
    #[cfg(feature = "tokio")]
    Tokio {
        _guard: tokio::sync::MutexGuard<'a, ()>,
    },
    #[cfg(feature = "async-lock")]
    AsyncLock {
        _guard: async_lock::MutexGuard<'a, ()>,
    },
    Futures {
        _guard: futures::lock::MutexGuard<'a, ()>,
    },
    Thread {
        _guard: parking_lot::MutexGuard<'a, ()>,
    },
}

/// Holds a [`FlightLock`] until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct FlightGuard<'a> {
    _inner: Guard<'a>,
}
