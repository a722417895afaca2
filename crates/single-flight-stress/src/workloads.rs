use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use single_flight::{LockSelector, Outcome, SingleFlight};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        Self::from_reader(file)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            ensure!(workload.concurrency > 0, "workload {i}: concurrency must be positive");
            // every attempt failing would make the resolvers spin forever
            if let Some(every) = workload.fail_every {
                ensure!(every >= 2, "workload {i}: fail_every must be at least 2");
            }
        }
        Ok(config)
    }
}

/// Where the resolvers of a round run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Every resolver is a Tokio task awaiting the computation.
    Tasks,
    /// Every resolver blocks a thread of the blocking pool.
    Threads,
    /// Alternates between tasks and blocking threads.
    Mixed,
}

impl Mode {
    fn on_thread(self, resolver: usize) -> bool {
        match self {
            Mode::Tasks => false,
            Mode::Threads => true,
            Mode::Mixed => resolver % 2 == 1,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub mode: Mode,
    pub concurrency: usize,
    /// How long each attempt of the computation takes.
    #[serde(with = "humantime_serde")]
    pub work: Duration,
    /// Every n-th attempt of this workload fails.
    #[serde(default)]
    pub fail_every: Option<u64>,
}

#[derive(Debug)]
struct InjectedFailure;

type Flight = SingleFlight<u64, InjectedFailure>;

/// Runs one round of `workload` against a fresh computation and returns how long it took.
///
/// `attempts` numbers attempts across all rounds of the workload, so that `fail_every` also
/// hits the first attempt of a round.
pub async fn run_round(
    selector: &LockSelector,
    workload: &Workload,
    attempts: &Arc<AtomicU64>,
) -> Result<Duration> {
    let start = Instant::now();
    let failures = Arc::new(AtomicU64::new(0));

    let factory = {
        let attempts = Arc::clone(attempts);
        let failures = Arc::clone(&failures);
        let work = workload.work;
        let fail_every = workload.fail_every;
        move || {
            let number = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let failures = Arc::clone(&failures);
            async move {
                tokio::time::sleep(work).await;
                if fail_every.is_some_and(|every| number % every == 0) {
                    failures.fetch_add(1, Ordering::Relaxed);
                    return Err(InjectedFailure);
                }
                Ok(number)
            }
        }
    };
    let flight = Arc::new(Flight::from_factory(factory).with_selector(selector.clone()));

    let resolvers: Vec<_> = (0..workload.concurrency)
        .map(|i| {
            let flight = Arc::clone(&flight);
            if workload.mode.on_thread(i) {
                tokio::task::spawn_blocking(move || resolve_on_thread(&flight))
            } else {
                tokio::spawn(resolve_in_task(flight))
            }
        })
        .collect();

    let values = futures::future::try_join_all(resolvers)
        .await
        .context("resolver panicked")?;
    let elapsed = start.elapsed();

    let Outcome::Resolved(&resolved) = flight.outcome() else {
        bail!("computation unresolved after all resolvers returned");
    };
    let successes = flight.attempts() - failures.load(Ordering::Relaxed);
    ensure!(
        successes == 1,
        "expected exactly one successful attempt, got {successes}"
    );
    ensure!(
        values.iter().all(|value| *value == resolved),
        "resolvers observed different values"
    );

    Ok(elapsed)
}

async fn resolve_in_task(flight: Arc<Flight>) -> u64 {
    loop {
        if let Ok(value) = flight.resolve().await {
            return *value;
        }
    }
}

fn resolve_on_thread(flight: &Flight) -> u64 {
    loop {
        if let Ok(value) = flight.resolve_blocking() {
            return *value;
        }
    }
}
