//! Higher-order constructors that turn functions producing computations into functions
//! producing [`SingleFlight`]s.

use std::future::Future;

use crate::flight::SingleFlight;
use crate::lock::LockSelector;

/// Wraps `f` so that each computation it produces can be awaited more than once.
///
/// ```
/// # futures::executor::block_on(async {
/// let square = single_flight::single_flight(|x: u64| async move { x * x });
///
/// let flight = square(7);
/// assert_eq!(flight.value().await, &49);
/// assert_eq!(flight.value().await, &49);
/// # });
/// ```
pub fn single_flight<A, F, Fut>(f: F) -> impl Fn(A) -> SingleFlight<Fut::Output>
where
    F: Fn(A) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    single_flight_with(LockSelector::default(), f)
}

/// Like [`single_flight`], with an explicit [`LockSelector`] for every produced computation.
pub fn single_flight_with<A, F, Fut>(
    selector: LockSelector,
    f: F,
) -> impl Fn(A) -> SingleFlight<Fut::Output>
where
    F: Fn(A) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    move |arg| SingleFlight::new(f(arg)).with_selector(selector.clone())
}

/// Wraps `f`, which builds an attempt factory per argument, into retrying computations.
///
/// See [`SingleFlight::from_factory`] for the failure semantics.
pub fn retrying<A, F, G, Fut, T, E>(f: F) -> impl Fn(A) -> SingleFlight<T, E>
where
    F: Fn(A) -> G,
    G: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    move |arg| SingleFlight::from_factory(f(arg))
}
