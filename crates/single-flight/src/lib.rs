//! Await a one-shot async computation any number of times.
//!
//! A [`SingleFlight`] wraps a computation so that many tasks, possibly spread over different
//! executors and OS threads, can all wait on it. The computation runs at most once to
//! successful completion and every waiter gets the same cached value.
//!
//! Waiters that arrive before the value is cached serialize on a [`FlightLock`]. Which kind
//! of lock that is gets decided lazily, on first use, by a [`LockSelector`] that probes the
//! concurrency runtime live at that moment:
//!
//! 1. a Tokio mutex, when running inside a Tokio runtime,
//! 2. an `async-lock` mutex, when that feature is compiled in and the caller is a task,
//! 3. a `futures` mutex, when the caller is a task on any other executor,
//! 4. a blocking thread mutex otherwise.
//!
//! ```
//! use single_flight::SingleFlight;
//!
//! # futures::executor::block_on(async {
//! let flight = SingleFlight::new(async { 6 * 7 });
//!
//! let (a, b) = futures::join!(flight.value(), flight.value());
//! assert_eq!((a, b), (&42, &42));
//! # });
//! ```

#![warn(missing_docs)]

mod config;
mod flight;
mod lock;
mod wrap;

pub use config::*;
pub use flight::*;
pub use lock::*;
pub use wrap::*;
