use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use single_flight::{FlightLock, LockBackend, LockSelector, Outcome, SingleFlight};
use single_flight_test::{Counter, capture_logs};

use crate::{counted, counted_sleep, current_thread_runtime};

fn lock_addr<T, E>(flight: &SingleFlight<T, E>) -> Option<usize> {
    flight.lock().map(|lock| lock as *const FlightLock as usize)
}

#[tokio::test]
async fn test_sequential_callers() {
    single_flight_test::setup();
    let counter = Counter::default();
    let flight = SingleFlight::new(counted(counter.clone(), 42));

    assert_eq!(flight.value().await, &42);
    assert_eq!(flight.value().await, &42);
    assert_eq!(flight.value().await, &42);

    assert_eq!(counter.get(), 1);
    assert_eq!(flight.outcome(), Outcome::Resolved(&42));
}

#[tokio::test]
async fn test_concurrent_tasks() {
    single_flight_test::setup();
    let counter = Counter::default();
    let flight = Arc::new(SingleFlight::new(counted(counter.clone(), 42)));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move { *flight.value().await })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), 42);
    }
    assert_eq!(counter.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_tasks_across_workers() {
    single_flight_test::setup();
    let counter = Counter::default();
    let flight = Arc::new(SingleFlight::new(counted_sleep(
        counter.clone(),
        String::from("shared"),
        Duration::from_millis(20),
    )));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                let value = flight.value().await;
                (value as *const String as usize, value.clone())
            })
        })
        .collect();

    let mut addresses = HashSet::new();
    for result in futures::future::join_all(tasks).await {
        let (address, value) = result.unwrap();
        assert_eq!(value, "shared");
        addresses.insert(address);
    }

    // Everybody got a reference to the very same cached value.
    assert_eq!(addresses.len(), 1);
    assert_eq!(counter.get(), 1);
    assert_eq!(flight.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_computation_with_paused_time() {
    let counter = Counter::default();
    let flight = SingleFlight::new(counted_sleep(
        counter.clone(),
        42,
        Duration::from_secs(60 * 60),
    ));

    let start = tokio::time::Instant::now();
    let results = futures::future::join_all((0..10).map(|_| flight.value())).await;

    assert!(results.iter().all(|value| **value == 42));
    assert_eq!(counter.get(), 1);
    // The clock auto-advanced past a single sleep, so nobody slept twice.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(60 * 60));
    assert!(elapsed < Duration::from_secs(2 * 60 * 60));
}

#[tokio::test]
async fn test_fast_path_skips_lock() {
    let counter = Counter::default();
    let flight = SingleFlight::new(counted(counter.clone(), 1u8));

    flight.value().await;
    let lock = flight.lock().unwrap();
    assert_eq!(lock.acquisitions(), 1);

    for _ in 0..10 {
        flight.value().await;
    }
    assert_eq!(lock.acquisitions(), 1);
    assert_eq!(flight.resolve_blocking(), Ok(&1));
    assert_eq!(lock.acquisitions(), 1);
}

#[test]
fn test_lock_is_created_once() {
    let counter = Counter::default();
    let flight = Rc::new(SingleFlight::new(counted(counter.clone(), 42)));

    let ((), logs) = capture_logs(|| {
        let runtime = current_thread_runtime();
        runtime.block_on(async {
            let local = tokio::task::LocalSet::new();
            let observed = Rc::new(RefCell::new(Vec::new()));
            for _ in 0..16 {
                let flight = Rc::clone(&flight);
                let observed = Rc::clone(&observed);
                local.spawn_local(async move {
                    flight.value().await;
                    observed.borrow_mut().push(lock_addr(&flight));
                });
            }
            local.await;

            let observed: HashSet<_> = observed.borrow().iter().copied().collect();
            assert_eq!(observed.len(), 1);
            assert!(observed.iter().all(Option::is_some));
        });
    });

    assert_eq!(counter.get(), 1);
    assert_eq!(logs.lines_containing("selected lock backend").len(), 1);
    assert_eq!(logs.lines_containing("starting computation").len(), 1);
}

#[test]
fn test_os_threads() {
    let counter = Counter::default();
    let flight = SingleFlight::new(counted(counter.clone(), 42));
    let barrier = Barrier::new(16);

    let addresses: HashSet<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    let value = flight.resolve_blocking().copied();
                    (value, lock_addr(&flight))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                let (value, address) = handle.join().unwrap();
                assert_eq!(value, Ok(42));
                address
            })
            .collect()
    });

    // All threads raced on first use and still ended up sharing a single lock.
    assert_eq!(addresses.len(), 1);
    assert!(addresses.iter().all(Option::is_some));

    assert_eq!(counter.get(), 1);
    assert_eq!(
        flight.lock().map(FlightLock::backend),
        Some(LockBackend::Thread)
    );
}

#[cfg(feature = "tokio")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_and_threads_share_one_flight() {
    single_flight_test::setup();
    let counter = Counter::default();
    let flight = Arc::new(SingleFlight::new(counted_sleep(
        counter.clone(),
        42,
        Duration::from_millis(20),
    )));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let flight = Arc::clone(&flight);
        let task = if i % 2 == 0 {
            tokio::spawn(async move { *flight.value().await })
        } else {
            tokio::task::spawn_blocking(move || match flight.resolve_blocking() {
                Ok(value) => *value,
                Err(never) => match never {},
            })
        };
        tasks.push(task);
    }

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), 42);
    }
    assert_eq!(counter.get(), 1);
    // Both tasks and runtime-owned threads see the Tokio context.
    assert_eq!(
        flight.lock().map(FlightLock::backend),
        Some(LockBackend::Tokio)
    );
}

#[test]
fn test_local_pool() {
    let counter = Counter::default();
    let flight = Rc::new(SingleFlight::new(counted(counter.clone(), 42)));
    let results = Rc::new(RefCell::new(Vec::new()));

    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    for _ in 0..8 {
        let flight = Rc::clone(&flight);
        let results = Rc::clone(&results);
        spawner
            .spawn_local(async move {
                let value = *flight.value().await;
                results.borrow_mut().push(value);
            })
            .unwrap();
    }
    pool.run();

    assert_eq!(*results.borrow(), vec![42; 8]);
    assert_eq!(counter.get(), 1);

    let backend = flight.lock().map(FlightLock::backend);
    if cfg!(feature = "async-lock") {
        assert_eq!(backend, Some(LockBackend::AsyncLock));
    } else {
        assert_eq!(backend, Some(LockBackend::Futures));
    }
}

#[test]
fn test_thread_fallback_shares_one_thread() {
    let selector = LockSelector::default()
        .disable(LockBackend::Tokio)
        .disable(LockBackend::AsyncLock)
        .disable(LockBackend::Futures);
    let counter = Counter::default();
    let flight = Rc::new(SingleFlight::new(counted(counter.clone(), 42)).with_selector(selector));
    let results = Rc::new(RefCell::new(Vec::new()));

    // The computation suspends while holding the lock, so the second task has to wait
    // on the same thread without parking it.
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    for _ in 0..2 {
        let flight = Rc::clone(&flight);
        let results = Rc::clone(&results);
        spawner
            .spawn_local(async move {
                let value = *flight.value().await;
                results.borrow_mut().push(value);
            })
            .unwrap();
    }
    pool.run();

    assert_eq!(*results.borrow(), vec![42, 42]);
    assert_eq!(counter.get(), 1);
    assert_eq!(
        flight.lock().map(FlightLock::backend),
        Some(LockBackend::Thread)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_fallback_serves_tasks() {
    let selector = LockSelector::default()
        .disable(LockBackend::Tokio)
        .disable(LockBackend::AsyncLock)
        .disable(LockBackend::Futures);
    let counter = Counter::default();
    let flight = Arc::new(SingleFlight::new(counted(counter.clone(), 42)).with_selector(selector));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move { *flight.value().await })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap(), 42);
    }
    assert_eq!(counter.get(), 1);
    assert_eq!(
        flight.lock().map(FlightLock::backend),
        Some(LockBackend::Thread)
    );
}
